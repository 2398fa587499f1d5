//! Diagnostic reporting for calcql.
//!
//! Validation of a query's directives produces a [`DiagnosticBag`]. Every
//! diagnostic carries the query path of the field it was reported on, so a
//! report can be read as a list of `{location_path, message}` entries.

use crate::span::Span;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DiagnosticSeverity {
    /// An error that rejects the whole query.
    Error,
    /// A warning that doesn't prevent execution.
    Warning,
}

/// A label pointing into a directive expression.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label {
    /// The span this label points to.
    pub span: Span,
    /// The label message.
    pub message: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }
}

/// A diagnostic message.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostic {
    /// Severity level.
    pub severity: DiagnosticSeverity,
    /// Error code.
    pub code: String,
    /// Short title.
    pub title: String,
    /// Detailed message.
    pub message: Option<String>,
    /// `#`-joined query path of the offending field.
    pub location_path: Option<String>,
    /// Labels pointing into expression sources.
    pub labels: Vec<Label>,
}

impl Diagnostic {
    /// Creates a new error diagnostic.
    pub fn error(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            code: code.into(),
            title: title.into(),
            message: None,
            location_path: None,
            labels: Vec::new(),
        }
    }

    /// Creates a new warning diagnostic.
    pub fn warning(code: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            ..Self::error(code, title)
        }
    }

    /// Adds a message to the diagnostic.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the query path the diagnostic refers to.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.location_path = Some(path.into());
        self
    }

    /// Adds a label at a span.
    pub fn with_span(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::new(span, message));
        self
    }

    /// Returns the primary span, if any.
    pub fn primary_span(&self) -> Option<Span> {
        self.labels.first().map(|l| l.span)
    }

    /// Returns true for error severity.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.title)?;
        if let Some(path) = &self.location_path {
            write!(f, " at `{path}`")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// A collection of diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticBag {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    /// Creates a new empty diagnostic bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a diagnostic.
    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Adds an error diagnostic reported on a query path.
    pub fn error(
        &mut self,
        code: impl Into<String>,
        title: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.add(
            Diagnostic::error(code, title)
                .with_path(path)
                .with_message(message),
        );
    }

    /// Adds a warning diagnostic reported on a query path.
    pub fn warning(
        &mut self,
        code: impl Into<String>,
        title: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.add(
            Diagnostic::warning(code, title)
                .with_path(path)
                .with_message(message),
        );
    }

    /// Moves every diagnostic of `other` into this bag.
    pub fn extend(&mut self, other: DiagnosticBag) {
        self.diagnostics.extend(other.diagnostics);
    }

    /// Returns true if there are any errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Returns the number of errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    /// Returns an iterator over all diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Returns an iterator over errors.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// Returns an iterator over warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }

    /// Returns true if any diagnostic has the given code.
    #[must_use]
    pub fn contains_code(&self, code: &str) -> bool {
        self.diagnostics.iter().any(|d| d.code == code)
    }

    /// Returns true if there are no diagnostics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Returns the number of diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }
}

impl fmt::Display for DiagnosticBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl IntoIterator for DiagnosticBag {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

/// Diagnostic codes reported by directive validation.
pub mod codes {
    pub const UNKNOWN_DIRECTIVE: &str = "E0101";
    pub const INVALID_DIRECTIVE_ARGUMENT: &str = "E0102";
    pub const DUPLICATE_DIRECTIVE: &str = "E0103";
    pub const CONFLICTING_FIELDS: &str = "E0104";
    pub const INVALID_EXPRESSION: &str = "E0110";
    pub const UNDEFINED_VARIABLE: &str = "E0111";
    pub const UNDEFINED_SOURCE: &str = "E0120";
    pub const DUPLICATE_SOURCE: &str = "E0121";
    pub const UNKNOWN_ARGUMENT: &str = "E0122";
    pub const LIST_MISMATCH: &str = "E0123";
    pub const CYCLE: &str = "E0130";
    pub const UNUSED_SOURCE: &str = "W0120";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_bag() {
        let mut bag = DiagnosticBag::new();
        bag.error(
            codes::UNDEFINED_SOURCE,
            "undefined source",
            "itemList",
            "no field publishes `itemIds`",
        );
        bag.warning(codes::CYCLE, "noise", "a", "b");

        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
        assert_eq!(bag.len(), 2);
        assert!(bag.contains_code(codes::UNDEFINED_SOURCE));
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::error(codes::CYCLE, "dependency cycle")
            .with_path("a#b")
            .with_message("`a#b` waits on itself")
            .with_span(Span::new(0, 3), "here");

        assert_eq!(
            diag.to_string(),
            "[E0130] dependency cycle at `a#b`: `a#b` waits on itself"
        );
        assert_eq!(diag.primary_span(), Some(Span::new(0, 3)));
    }
}
