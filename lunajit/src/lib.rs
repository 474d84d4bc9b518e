//! Direct-to-native compiler for a small Lua-like language
//!
//! Source text is parsed straight into an SSA instruction log (with phi
//! joins placed during parsing), optimized, run through liveness analysis and
//! a linear-scan register allocator, then encoded as x86-64 machine code in
//! executable memory.  There is no interpreter: every function runs natively.
//!
//! ```
//! # #[cfg(feature = "jit")] {
//! use lunajit::State;
//!
//! let mut state = State::new();
//! let out = state
//!     .exec("local s = 0 for i = 1, 4 do s = s + i end return s")
//!     .unwrap();
//! assert_eq!(out.as_number(), Some(10.0));
//!
//! // Functions defined by a chunk live on in the state's globals
//! state.exec("function sq(x) return x * x end").unwrap();
//! let sq = state.get_global("sq");
//! let nine = state.call(sq, &[lunajit::Value::number(3.0)]).unwrap();
//! assert_eq!(nine.as_number(), Some(9.0));
//! # }
//! ```
pub mod compiler;
pub mod frontend;
pub mod ir;
pub mod runtime;
pub mod value;

#[cfg(feature = "jit")]
pub mod jit;

mod error;
mod indexed;

pub use compiler::CompileSettings;
pub use error::Error;
pub use runtime::State;
pub use value::Value;

#[cfg(feature = "jit")]
impl State {
    /// Compiles a chunk with default settings, returning its entry function
    pub fn load(&mut self, src: &str) -> Result<Value, Error> {
        self.load_with(src, &CompileSettings::default())
    }

    /// Compiles a chunk, returning its entry function
    ///
    /// Nothing runs until the returned value is passed to [`State::call`].
    pub fn load_with(
        &mut self,
        src: &str,
        settings: &CompileSettings,
    ) -> Result<Value, Error> {
        let unit = frontend::parse(src, self)?;
        compiler::compile(unit, self, settings)
    }

    /// Compiles and runs a chunk, returning the value of its `return`
    pub fn exec(&mut self, src: &str) -> Result<Value, Error> {
        let f = self.load(src)?;
        self.call(f, &[])
    }
}
