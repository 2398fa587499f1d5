//! Runtime for calcql.
//!
//! This crate provides the dependency-aware query executor:
//! - `graph`: Task graph construction and plan rendering
//! - `task`: Per-execution slots and list collectors
//! - `scheduler`: The per-field pipeline
//! - `executor`: The `Engine` and response assembly
//! - `fetcher`: Field fetchers
//! - `transform`: `filter`, `sortBy`, `distinct` and `map` handlers
//! - `projector`: Value projection into expression environments
//! - `cache`: Task graph reuse

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod graph;
pub mod projector;
mod scheduler;
pub mod task;
pub mod transform;

pub use cache::{shape_key, GraphCache, ShapeKey};
pub use config::ExecutorConfig;
pub use error::{
    codes, ExecuteError, FetchError, FieldError, PathSegment, SchedulingInvariantViolation,
    TransformError,
};
pub use executor::{Engine, Response};
pub use fetcher::{
    AsyncFnFetcher, FetchArgs, FetchFuture, FetchRequest, FetchResult, Fetcher, FetcherMap,
    FnFetcher, PropertyFetcher,
};
pub use graph::{FetchTask, FieldSpec, TaskGraph, TaskId};
pub use projector::{FlattenProjector, ValueProjector};
pub use task::{ExecutionState, TaskOutcome, TaskSlot};
pub use transform::{TransformEnv, TransformHandler, TransformRegistry};
