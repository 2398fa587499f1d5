//! Errors surfaced by execution.

use calcql_core::DiagnosticBag;
use calcql_expr::EvalError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Values of `extensions.code` on field errors.
pub mod codes {
    /// The field's own fetch failed.
    pub const FETCH_ERROR: &str = "FETCH_ERROR";
    /// A source the field consumes failed.
    pub const SOURCE_FAILED: &str = "SOURCE_FAILED";
    /// A directive expression failed to evaluate.
    pub const EVALUATION_ERROR: &str = "EVALUATION_ERROR";
    /// The work was abandoned before it finished.
    pub const CANCELLED: &str = "CANCELLED";
    /// The scheduler detected a broken invariant.
    pub const INTERNAL: &str = "INTERNAL";
}

/// A field error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// The error message.
    pub message: String,
    /// The path to the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// Error extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<IndexMap<String, Value>>,
}

/// A response path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Renders a response path as `a.0.b`.
pub fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Adds a path to the error.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", Value::String(code.into()))
    }

    /// The error code extension, if any.
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(Value::as_str)
    }

    pub(crate) fn evaluation(context: &str, error: &EvalError) -> Self {
        Self::new(format!("{context}: {error}")).with_code(codes::EVALUATION_ERROR)
    }
}

/// Error from a fetcher.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("field `{0}` not found on parent value")]
    FieldNotFound(String),

    #[error("missing required argument `{0}`")]
    MissingArgument(String),

    #[error("failed to parse argument `{0}`: {1}")]
    ArgumentParse(String, String),

    #[error("no fetcher registered for `{0}`")]
    NoFetcher(String),

    #[error("fetch was cancelled")]
    Cancelled,

    #[error("{0}")]
    Custom(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FetchError> for FieldError {
    fn from(error: FetchError) -> Self {
        let code = if error == FetchError::Cancelled {
            codes::CANCELLED
        } else {
            codes::FETCH_ERROR
        };
        FieldError::new(error.to_string()).with_code(code)
    }
}

/// Error from a value transform.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("`@{directive}` failed: {source}")]
    Evaluation {
        directive: &'static str,
        #[source]
        source: EvalError,
    },

    #[error("no transform handler supports `@{0}`")]
    Unsupported(String),
}

impl From<TransformError> for FieldError {
    fn from(error: TransformError) -> Self {
        FieldError::new(error.to_string()).with_code(codes::EVALUATION_ERROR)
    }
}

/// A broken scheduler invariant. Fatal to the engine that observed it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingInvariantViolation {
    #[error("task `{path}` was completed twice")]
    DoubleWrite { path: String },

    #[error("source `{0}` has no publishing task")]
    UnknownSource(String),
}

/// A whole-request execution failure.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    #[error("query failed validation with {} error(s)", .0.error_count())]
    Validation(DiagnosticBag),

    #[error(transparent)]
    Invariant(#[from] SchedulingInvariantViolation),

    #[error("engine is poisoned by an earlier scheduling invariant violation")]
    Poisoned,

    #[error("no tokio runtime available to run fetches")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_error_serialization() {
        let error = FieldError::new("boom")
            .with_path(vec![
                PathSegment::Field("items".to_string()),
                PathSegment::Index(2),
                PathSegment::Field("price".to_string()),
            ])
            .with_code(codes::FETCH_ERROR);

        assert_eq!(error.code(), Some("FETCH_ERROR"));
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "message": "boom",
                "path": ["items", 2, "price"],
                "extensions": {"code": "FETCH_ERROR"}
            })
        );
        assert_eq!(display_path(error.path.as_deref().unwrap()), "items.2.price");
    }

    #[test]
    fn test_fetch_error_codes() {
        let error: FieldError = FetchError::Custom("down".to_string()).into();
        assert_eq!(error.code(), Some(codes::FETCH_ERROR));
        assert_eq!(error.message, "down");

        let error: FieldError = FetchError::Cancelled.into();
        assert_eq!(error.code(), Some(codes::CANCELLED));
    }
}
