//! Semantic layer for calcql.
//!
//! This crate provides:
//! - `hir`: The resolved query model
//! - `path`: `#`-joined query paths
//! - `directives`: Directive definitions and typed decoding
//! - `checker`: Validation of directives, sources and dependencies

pub mod checker;
pub mod directives;
pub mod hir;
pub mod path;

pub use checker::{check, CheckResult, Checker};
pub use directives::{
    ConsumeOperation, ConsumeSource, DirectiveError, DirectiveRegistry, FieldDirective,
    FieldDirectives, PublishSource,
};
pub use hir::{
    collect_fields, merge_fields, Argument, DirectiveBinding, Field, MergedField, Operation,
    Selection, TypeRef, VariableDefinition,
};
