//! Lexer and single-pass parser
//!
//! The parser emits IR directly through a [`Builder`](crate::ir::Builder);
//! there is no syntax tree.
mod lexer;
mod parser;

pub use lexer::{Keyword, Spanned, Token, tokenize};
pub use parser::parse;
