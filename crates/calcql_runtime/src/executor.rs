//! Query execution for calcql.

use crate::cache::{shape_key, GraphCache};
use crate::config::ExecutorConfig;
use crate::error::{ExecuteError, FieldError, PathSegment, SchedulingInvariantViolation};
use crate::fetcher::FetcherMap;
use crate::graph::{FetchTask, TaskGraph, TaskId};
use crate::projector::{FlattenProjector, ValueProjector};
use crate::scheduler::{run_field, RunContext};
use crate::task::{ExecutionState, TaskOutcome};
use crate::transform::{TransformHandler, TransformRegistry};
use calcql_expr::{Calculator, Environment, ExpressionEngine};
use calcql_semantic::checker::{self, CheckResult};
use calcql_semantic::directives::{DirectiveDefinition, DirectiveRegistry};
use calcql_semantic::hir::Operation;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

/// The query engine.
///
/// An engine validates operations, caches their task graphs, and executes
/// them against its fetchers. A scheduling invariant violation poisons the
/// engine: every later call fails with [`ExecuteError::Poisoned`].
pub struct Engine {
    config: ExecutorConfig,
    registry: DirectiveRegistry,
    fetchers: Arc<FetcherMap>,
    expressions: Arc<dyn ExpressionEngine>,
    transforms: TransformRegistry,
    projector: Arc<dyn ValueProjector>,
    cache: GraphCache,
    poisoned: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("fetchers", &self.fetchers)
            .field("cached_graphs", &self.cache.len())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(fetchers: FetcherMap) -> Self {
        Self::with_config(fetchers, ExecutorConfig::default())
    }

    /// Creates an engine with configuration.
    pub fn with_config(fetchers: FetcherMap, config: ExecutorConfig) -> Self {
        Self {
            cache: GraphCache::new(config.graph_cache_capacity),
            config,
            registry: DirectiveRegistry::builtin(),
            fetchers: Arc::new(fetchers),
            expressions: Arc::new(Calculator::new()),
            transforms: TransformRegistry::builtin(),
            projector: Arc::new(FlattenProjector),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Replaces the expression engine.
    pub fn with_expression_engine(mut self, engine: Arc<dyn ExpressionEngine>) -> Self {
        self.expressions = engine;
        self.cache.clear();
        self
    }

    /// Replaces the projector used by transforms.
    pub fn with_projector(mut self, projector: Arc<dyn ValueProjector>) -> Self {
        self.projector = projector;
        self
    }

    /// Registers an additional directive definition.
    pub fn with_directive(mut self, definition: DirectiveDefinition) -> Self {
        self.registry.register(definition);
        self.cache.clear();
        self
    }

    /// Registers a transform handler, taking precedence over built-ins.
    pub fn with_transform<H: TransformHandler + 'static>(mut self, handler: H) -> Self {
        self.transforms.register(handler);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &DirectiveRegistry {
        &self.registry
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Validates an operation.
    pub fn validate(&self, operation: &Operation) -> CheckResult {
        checker::check(operation, &self.registry, self.expressions.as_ref())
    }

    /// Returns the task graph of a valid operation, building it on a cache
    /// miss.
    pub fn plan(&self, operation: &Operation) -> Result<Arc<TaskGraph>, ExecuteError> {
        let key = shape_key(operation);
        if let Some(graph) = key.as_ref().and_then(|key| self.cache.get(key)) {
            debug!(tasks = graph.tasks().len(), "task graph cache hit");
            return Ok(graph);
        }

        let result = self.validate(operation);
        if !result.is_ok() {
            info!(
                errors = result.diagnostics.error_count(),
                "operation failed validation"
            );
            return Err(ExecuteError::Validation(result.diagnostics));
        }

        let graph = Arc::new(TaskGraph::build_with(operation, &self.registry));
        match key {
            Some(key) => self.cache.insert(key, Arc::clone(&graph)),
            None => warn!("operation shape could not be encoded; graph not cached"),
        }
        Ok(graph)
    }

    /// Executes an operation with the given variable values.
    pub async fn execute(
        &self,
        operation: &Operation,
        variables: &Map<String, Value>,
    ) -> Result<Response, ExecuteError> {
        if self.is_poisoned() {
            return Err(ExecuteError::Poisoned);
        }
        let runtime = match &self.config.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| ExecuteError::NoRuntime)?,
        };
        let graph = self.plan(operation)?;

        let variables: Environment = operation.resolve_variables(variables).into_iter().collect();
        let ctx = RunContext {
            state: ExecutionState::new(Arc::clone(&graph)),
            fetchers: Arc::clone(&self.fetchers),
            expressions: self.expressions.as_ref(),
            transforms: &self.transforms,
            projector: self.projector.as_ref(),
            variables,
            runtime,
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1))),
            errors: RwLock::new(Vec::new()),
            violation: OnceLock::new(),
            flatten: self.config.collect_list_sources_flatten,
        };

        info!(
            operation = operation.name.as_deref().unwrap_or("<anonymous>"),
            tasks = graph.len(),
            "executing operation"
        );

        // Root value (empty object for Query)
        let root = Value::Object(Map::new());
        let data = execute_selection(&ctx, graph.roots(), &root, &[]).await;

        if let Some(violation) = ctx.violation.into_inner() {
            warn!(error = %violation, "poisoning engine");
            self.poisoned.store(true, Ordering::Release);
            return Err(violation.into());
        }

        let mut errors = ctx.errors.into_inner();
        errors.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Response {
            data: Some(Value::Object(data)),
            errors: (!errors.is_empty()).then_some(errors),
        })
    }
}

/// Executes sibling fields concurrently.
fn execute_selection<'a>(
    ctx: &'a RunContext<'a>,
    tasks: &'a [TaskId],
    parent: &'a Value,
    path: &'a [PathSegment],
) -> BoxFuture<'a, Map<String, Value>> {
    Box::pin(async move {
        let fields = tasks.iter().map(move |&id| async move {
            let task = ctx.graph().task(id);
            let value = execute_field(ctx, task, parent, path).await;
            (task.mapper_key.as_str(), value)
        });

        let mut result = Map::new();
        for (key, value) in join_all(fields).await {
            if let Some(value) = value {
                result.insert(key.to_string(), value);
            }
        }
        result
    })
}

/// Executes a field and its subtree. Skipped fields produce no key.
fn execute_field<'a>(
    ctx: &'a RunContext<'a>,
    task: &'a FetchTask,
    parent: &'a Value,
    path: &'a [PathSegment],
) -> BoxFuture<'a, Option<Value>> {
    Box::pin(async move {
        let mut field_path = path.to_vec();
        field_path.push(PathSegment::Field(task.mapper_key.clone()));

        if !task.is_in_list && !ctx.state.slot(task.id).claim() {
            ctx.violate(SchedulingInvariantViolation::DoubleWrite {
                path: task.path.clone(),
            });
            return Some(Value::Null);
        }

        let result = run_field(ctx, task, parent).await;
        ctx.record(task, &field_path, &result).await;

        match result.outcome {
            TaskOutcome::Absent => {
                ctx.state.abandon(task.id);
                None
            }
            TaskOutcome::Failed(_) => {
                ctx.state.abandon(task.id);
                Some(Value::Null)
            }
            TaskOutcome::Resolved(value) => {
                let completed = complete_value(ctx, task, value, &field_path).await;
                if task.is_list_root() {
                    if completed.is_array() {
                        if let Err(violation) = ctx.state.seal(task.id, true, ctx.flatten).await {
                            ctx.violate(violation);
                        }
                    } else {
                        ctx.state.abandon(task.id);
                    }
                }
                Some(completed)
            }
        }
    })
}

/// Completes a fetched value against the field's sub-selection.
fn complete_value<'a>(
    ctx: &'a RunContext<'a>,
    task: &'a FetchTask,
    value: Value,
    path: &'a [PathSegment],
) -> BoxFuture<'a, Value> {
    Box::pin(async move {
        if task.children.is_empty() {
            return value;
        }
        match value {
            Value::Null => {
                // A null list element drops only its own selection.
                if !matches!(path.last(), Some(PathSegment::Index(_))) {
                    ctx.state.abandon(task.id);
                }
                Value::Null
            }
            Value::Array(items) => {
                let elements = items.into_iter().enumerate().map(move |(index, item)| {
                    let mut item_path = path.to_vec();
                    item_path.push(PathSegment::Index(index));
                    async move { complete_value(ctx, task, item, &item_path).await }
                });
                Value::Array(join_all(elements).await)
            }
            parent => Value::Object(execute_selection(ctx, &task.children, &parent, path).await),
        }
    })
}

/// A query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

impl Response {
    /// Creates a successful response with data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    /// Returns true if the response has errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Returns true if the response has data.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Looks up a value by response keys.
    pub fn get(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .try_fold(self.data.as_ref()?, |value, key| value.get(*key))
    }

    /// Errors carrying the given code.
    pub fn errors_with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a FieldError> {
        self.errors
            .iter()
            .flatten()
            .filter(move |error| error.code() == Some(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use calcql_semantic::hir::{DirectiveBinding, Field, TypeRef};
    use serde_json::json;

    fn engine() -> Engine {
        let mut fetchers = FetcherMap::new();
        fetchers.register_fn("Query", "hello", |_| Ok(json!("world")));
        fetchers.register_fn("Query", "user", |_| Ok(json!({"id": 1, "name": "Alice"})));
        fetchers.register_fn("Query", "broken", |_| {
            Err(crate::error::FetchError::Custom("backend down".to_string()))
        });
        Engine::new(fetchers)
    }

    #[tokio::test]
    async fn test_execute_simple_query() {
        let operation = Operation::new()
            .field(Field::new("hello", "Query"))
            .field(
                Field::new("user", "Query")
                    .returns(TypeRef::named("User"))
                    .field(Field::new("name", "User")),
            );

        let response = engine().execute(&operation, &Map::new()).await.unwrap();
        assert!(!response.has_errors());
        assert_eq!(
            response.data,
            Some(json!({"hello": "world", "user": {"name": "Alice"}}))
        );
    }

    #[tokio::test]
    async fn test_execute_with_error() {
        let operation = Operation::new()
            .field(Field::new("hello", "Query"))
            .field(Field::new("broken", "Query"));

        let response = engine().execute(&operation, &Map::new()).await.unwrap();
        assert_eq!(response.get(&["broken"]), Some(&Value::Null));
        assert_eq!(response.get(&["hello"]), Some(&json!("world")));

        let errors = response.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "backend down");
        assert_eq!(errors[0].code(), Some(codes::FETCH_ERROR));
        assert_eq!(
            errors[0].path,
            Some(vec![PathSegment::Field("broken".to_string())])
        );
    }

    #[tokio::test]
    async fn test_plan_is_cached() {
        let engine = engine();
        let operation = Operation::new().field(Field::new("hello", "Query"));
        let first = engine.plan(&operation).unwrap();
        let second = engine.plan(&operation).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_distinct_shapes_get_distinct_plans() {
        let engine = engine();
        let plain = Operation::new().field(Field::new("hello", "Query"));
        let aliased = Operation::new().field(Field::new("hello", "Query").alias("greeting"));
        let first = engine.plan(&plain).unwrap();
        let second = engine.plan(&aliased).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&engine.plan(&plain).unwrap(), &first));

        let response = engine.execute(&aliased, &Map::new()).await.unwrap();
        assert_eq!(response.get(&["greeting"]), Some(&json!("world")));
        assert_eq!(response.get(&["hello"]), None);
    }

    #[tokio::test]
    async fn test_validation_error() {
        let operation = Operation::new().field(
            Field::new("hello", "Query").directive(DirectiveBinding::new("nope")),
        );
        let result = engine().execute(&operation, &Map::new()).await;
        assert!(matches!(result, Err(ExecuteError::Validation(_))));
    }

    #[tokio::test]
    async fn test_poisoned_engine_rejects_work() {
        let engine = engine();
        engine.poison();
        let operation = Operation::new().field(Field::new("hello", "Query"));
        let result = engine.execute(&operation, &Map::new()).await;
        assert!(matches!(result, Err(ExecuteError::Poisoned)));
    }

    #[test]
    fn test_no_runtime() {
        let operation = Operation::new().field(Field::new("hello", "Query"));
        let result = futures::executor::block_on(engine().execute(&operation, &Map::new()));
        assert!(matches!(result, Err(ExecuteError::NoRuntime)));
    }

    #[test]
    fn test_response_helpers() {
        let response = Response::data(json!({"user": {"name": "Alice"}}));
        assert!(response.has_data());
        assert!(!response.has_errors());
        assert_eq!(response.get(&["user", "name"]), Some(&json!("Alice")));
        assert_eq!(response.errors_with_code(codes::FETCH_ERROR).count(), 0);
    }
}
