//! Core utilities for calcql.
//!
//! This crate provides foundational types used throughout calcql:
//! - `span`: Source location tracking inside directive expressions
//! - `diagnostics`: Structured validation reports

pub mod diagnostics;
pub mod span;

pub use diagnostics::{codes, Diagnostic, DiagnosticBag, DiagnosticSeverity, Label};
pub use span::Span;
