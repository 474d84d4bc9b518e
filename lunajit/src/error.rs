//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for `lunajit`
#[derive(Error, Debug)]
pub enum Error {
    /// Source text could not be parsed
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number where the problem was found
        line: usize,
        /// Human-readable description
        message: String,
    },

    /// A value-level error raised by generated code or a builtin
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The value passed to [`State::call`](crate::State::call) is not callable
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),

    /// Executable memory could not be mapped or protected
    #[error("could not map executable memory: {0}")]
    Mmap(#[from] std::io::Error),
}
