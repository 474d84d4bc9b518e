use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use lunajit::{CompileSettings, State, compiler, frontend};

/// Compile and run scripts natively
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Input file
    #[clap(short, long)]
    input: PathBuf,

    #[clap(flatten)]
    settings: Settings,
}

#[derive(Subcommand)]
enum Command {
    /// Compile the script and run it
    Run {
        /// Number of times to run the compiled chunk
        #[clap(short = 'N', default_value = "1")]
        n: usize,

        /// Don't echo `print` output to stdout
        #[clap(short, long)]
        quiet: bool,
    },

    /// Print the instruction log
    Dump {
        /// Print the log after optimization and phi elimination
        #[clap(short, long)]
        lowered: bool,
    },
}

#[derive(Parser)]
struct Settings {
    /// Skip the peephole and constant-folding passes
    #[clap(long)]
    no_opt: bool,

    /// Number of registers given to the allocator
    #[clap(short, long, default_value = "6")]
    registers: usize,
}

impl From<&Settings> for CompileSettings {
    fn from(s: &Settings) -> Self {
        CompileSettings {
            optimize: !s.no_opt,
            registers: s.registers,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let now = Instant::now();
    let args = Args::parse();
    let src = std::fs::read_to_string(&args.input)?;
    info!("Loaded file in {:?}", now.elapsed());

    let settings = CompileSettings::from(&args.settings);
    let mut state = State::new();
    match args.cmd {
        Command::Dump { lowered } => {
            let start = Instant::now();
            let mut unit = frontend::parse(&src, &mut state)?;
            if lowered {
                compiler::lower(&mut unit, &settings);
            }
            info!("Built instruction log in {:?}", start.elapsed());
            print!("{}", unit.dump());
        }
        Command::Run { n, quiet } => {
            if n == 0 {
                bail!("-N must be at least 1");
            }
            state.set_echo(!quiet);
            let start = Instant::now();
            let f = state.load_with(&src, &settings)?;
            info!("Compiled in {:?}", start.elapsed());

            let start = Instant::now();
            let mut out = lunajit::Value::NIL;
            for _ in 0..n {
                out = state.call(f, &[])?;
            }
            info!(
                "Ran {n}x at {:?} ms/run",
                start.elapsed().as_micros() as f64 / 1000.0 / (n as f64)
            );
            if !out.is_nil() {
                println!("{}", state.tostring(out));
            }
        }
    }
    Ok(())
}
