//! toolscript front end: tokenizer, syntax tree and parser.
//!
//! The validator and the runtime share the tree produced here, so what the
//! structural pass inspects is exactly what the interpreter executes.

pub mod ast;
mod lexer;
mod parser;

use serde::{Deserialize, Serialize};

pub use ast::Program;
pub use parser::parse;

/// Nesting depth of blocks and expressions accepted by the parser.
pub const MAX_NESTING: usize = 40;

/// 1-based source position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{span}: {message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}
