//! Expression language for calcql directives.
//!
//! This crate provides:
//! - `token`: Token kinds and token structures
//! - `lexer`: Tokenization
//! - `ast`: Expression tree types
//! - `parser`: Precedence-climbing parser
//! - `eval`: Evaluation over JSON values
//! - `engine`: The `ExpressionEngine` seam and the caching `Calculator`

pub mod ast;
pub mod engine;
pub mod env;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
pub use engine::{Calculator, ExpressionEngine, Program, ValidationResult};
pub use env::{Environment, ELEMENT};
pub use error::{CompileError, EvalError};
pub use eval::{compare_values, type_name, values_equal};
pub use lexer::{tokenize, Lexer};
pub use parser::parse;
pub use token::{Token, TokenKind};
