//! Errors raised while compiling or evaluating expressions.

use calcql_core::Span;
use miette::SourceSpan;
use thiserror::Error;

/// An expression that failed to compile.
#[derive(Debug, Clone, Error, miette::Diagnostic)]
#[error("{message}")]
#[diagnostic(code(calcql::expr::compile))]
pub struct CompileError {
    /// What went wrong.
    pub message: String,
    #[source_code]
    source_code: String,
    #[label("here")]
    location: SourceSpan,
}

impl CompileError {
    pub fn new(message: impl Into<String>, source: &str, span: Span) -> Self {
        Self {
            message: message.into(),
            source_code: source.to_string(),
            location: span.into(),
        }
    }

    /// The expression source that failed to compile.
    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    /// Where in the source the problem was found.
    pub fn span(&self) -> Span {
        let start = self.location.offset() as u32;
        Span::new(start, start + self.location.len() as u32)
    }
}

/// A typed failure while evaluating a compiled expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("undefined variable `{0}`")]
    UndefinedVariable(String),

    #[error("type mismatch in `{op}`: expected {expected}, found {found}")]
    TypeMismatch {
        op: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("numeric overflow in `{0}`")]
    Overflow(String),

    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{function}` expects {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("compile error: {0}")]
    Compile(String),
}

impl From<CompileError> for EvalError {
    fn from(error: CompileError) -> Self {
        Self::Compile(error.message)
    }
}
