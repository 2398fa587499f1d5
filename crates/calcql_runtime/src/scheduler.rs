//! Per-field scheduling.
//!
//! A field runs through a fixed pipeline: skip conditions, source
//! consumption, fetch (or mock), transforms, then publication. Every step
//! that can wait does so on a [`TaskSlot`](crate::task::TaskSlot); nothing
//! blocks the traversal thread.

use crate::error::{codes, FetchError, FieldError, PathSegment, SchedulingInvariantViolation};
use crate::fetcher::{FetchArgs, FetchRequest, FetcherMap};
use crate::graph::{FetchTask, TaskGraph};
use crate::projector::ValueProjector;
use crate::task::{ExecutionState, TaskOutcome};
use crate::transform::{TransformEnv, TransformRegistry};
use calcql_expr::{type_name, Environment, ExpressionEngine, ELEMENT};
use calcql_semantic::directives::{self, ConsumeOperation, ConsumeSource, PublishSource};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Everything one execution shares.
pub(crate) struct RunContext<'e> {
    pub(crate) state: ExecutionState,
    pub(crate) fetchers: Arc<FetcherMap>,
    pub(crate) expressions: &'e dyn ExpressionEngine,
    pub(crate) transforms: &'e TransformRegistry,
    pub(crate) projector: &'e dyn ValueProjector,
    pub(crate) variables: Environment,
    pub(crate) runtime: Handle,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) errors: RwLock<Vec<FieldError>>,
    pub(crate) violation: OnceLock<SchedulingInvariantViolation>,
    /// Flatten list values of sources collected from inside lists.
    pub(crate) flatten: bool,
}

impl RunContext<'_> {
    pub(crate) fn graph(&self) -> &TaskGraph {
        self.state.graph()
    }

    pub(crate) async fn push_error(&self, error: FieldError) {
        self.errors.write().await.push(error);
    }

    /// Records a broken invariant. The first one wins.
    pub(crate) fn violate(&self, violation: SchedulingInvariantViolation) {
        warn!(error = %violation, "scheduling invariant violated");
        let _ = self.violation.set(violation);
    }

    /// Records a field's result: its error, and its value for consumers.
    pub(crate) async fn record(&self, task: &FetchTask, path: &[PathSegment], result: &FieldResult) {
        if let TaskOutcome::Failed(error) = &result.outcome {
            self.push_error(error.clone().with_path(path.to_vec())).await;
        }

        let published = result.published();
        if !task.is_in_list {
            if let Err(violation) = self.state.fulfil(task.id, published) {
                self.violate(violation);
            }
        } else if task.is_top_task {
            if let TaskOutcome::Resolved(value) = published {
                let indices = path
                    .iter()
                    .filter_map(|segment| match segment {
                        PathSegment::Index(index) => Some(*index),
                        PathSegment::Field(_) => None,
                    })
                    .collect();
                self.state.collect(task.id, indices, value).await;
            }
        }
    }

    fn transform_env(&self) -> TransformEnv<'_> {
        TransformEnv {
            engine: self.expressions,
            projector: self.projector,
            variables: &self.variables,
        }
    }

    fn evaluate(&self, directive: &str, source: &str, env: &Environment) -> Result<Value, FieldError> {
        self.expressions
            .evaluate(source, env)
            .map_err(|error| FieldError::evaluation(&format!("`@{directive}({source})`"), &error))
    }

    fn predicate(&self, directive: &str, source: &str, env: &Environment) -> Result<bool, FieldError> {
        self.expressions
            .evaluate_predicate(source, env)
            .map_err(|error| FieldError::evaluation(&format!("`@{directive}({source})`"), &error))
    }

    fn is_skipped(&self, task: &FetchTask) -> Result<bool, FieldError> {
        let field = &task.field.directives;
        if let Some(condition) = &field.skip_if {
            if self.predicate(directives::SKIP_IF, condition, &self.variables)? {
                return Ok(true);
            }
        }
        if let Some(condition) = &field.include_if {
            if !self.predicate(directives::INCLUDE_IF, condition, &self.variables)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Variables, then the field's arguments.
    fn argument_env(&self, arguments: &FetchArgs) -> Environment {
        let mut env = self.variables.clone();
        env.extend(arguments.all().iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Waits for a source and computes the argument value it feeds.
    async fn consume(
        &self,
        task: &FetchTask,
        consume: &ConsumeSource,
        arguments: &FetchArgs,
    ) -> Result<Value, FieldError> {
        let Some(top) = self.graph().top_task(&consume.name) else {
            let violation = SchedulingInvariantViolation::UnknownSource(consume.name.clone());
            let error = FieldError::new(violation.to_string()).with_code(codes::INTERNAL);
            self.violate(violation);
            return Err(error);
        };

        debug!(
            task_id = task.id.as_raw(),
            path = %task.path,
            source = %consume.name,
            "waiting for source"
        );
        let source = match self.state.slot(top).wait().await {
            TaskOutcome::Resolved(value) => value,
            TaskOutcome::Absent => Value::Null,
            TaskOutcome::Failed(error) => {
                return Err(FieldError::new(format!(
                    "source `{}` failed: {}",
                    consume.name, error.message
                ))
                .with_code(codes::SOURCE_FAILED)
                .with_extension("source", Value::String(consume.name.clone())));
            }
        };

        let mut env = self.argument_env(arguments);
        let context = format!("`@{}({})`", directives::CONSUME_SOURCE, consume.name);

        if consume.operation == ConsumeOperation::Map {
            env.insert(consume.name.clone(), source);
            return self
                .expressions
                .evaluate(&consume.expression, &env)
                .map_err(|error| FieldError::evaluation(&context, &error));
        }

        let items = match &source {
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            other => {
                return Err(FieldError::new(format!(
                    "{context}: {} needs a list source, found {}",
                    consume.operation.as_str(),
                    type_name(other)
                ))
                .with_code(codes::EVALUATION_ERROR));
            }
        };
        env.insert(consume.name.clone(), source);

        let mut values = Vec::with_capacity(items.len());
        for item in items {
            env.insert(ELEMENT, item.clone());
            match consume.operation {
                ConsumeOperation::ListMap => values.push(
                    self.expressions
                        .evaluate(&consume.expression, &env)
                        .map_err(|error| FieldError::evaluation(&context, &error))?,
                ),
                ConsumeOperation::Filter => {
                    let keep = self
                        .expressions
                        .evaluate_predicate(&consume.expression, &env)
                        .map_err(|error| FieldError::evaluation(&context, &error))?;
                    if keep {
                        values.push(item);
                    }
                }
                ConsumeOperation::Map => {}
            }
        }
        Ok(Value::Array(values))
    }

    /// Runs the field's fetcher on the worker runtime.
    async fn fetch(
        &self,
        task: &FetchTask,
        parent: &Value,
        arguments: FetchArgs,
    ) -> Result<Value, FieldError> {
        let request = FetchRequest {
            path: task.path.clone(),
            field_name: task.field.name.clone(),
            parent_type: task.field.parent_type.clone(),
            return_type: task.field.return_type.clone(),
            parent: parent.clone(),
            arguments,
        };
        let fetchers = Arc::clone(&self.fetchers);
        let semaphore = Arc::clone(&self.semaphore);

        debug!(task_id = task.id.as_raw(), path = %task.path, "fetching");
        let handle = self.runtime.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| FetchError::Cancelled)?;
            fetchers.fetch(request).await
        });

        match handle.await {
            Ok(result) => result.map_err(FieldError::from),
            Err(error) if error.is_cancelled() => Err(FetchError::Cancelled.into()),
            Err(error) => Err(FetchError::Internal(error.to_string()).into()),
        }
    }

    /// The value consumers of `publish` see.
    fn publish(&self, publish: &PublishSource, value: &Value) -> Result<Value, FieldError> {
        let Some(convert) = &publish.convert else {
            return Ok(value.clone());
        };
        let env = self
            .variables
            .clone()
            .with(publish.name.clone(), value.clone())
            .with(ELEMENT, value.clone());
        self.evaluate(directives::PUBLISH_SOURCE, convert, &env)
    }
}

/// What running one field produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldResult {
    pub(crate) outcome: TaskOutcome,
    /// The converted value for consumers, when it differs from `outcome`.
    pub(crate) published: Option<TaskOutcome>,
}

impl FieldResult {
    fn absent() -> Self {
        Self {
            outcome: TaskOutcome::Absent,
            published: None,
        }
    }

    fn failed(error: FieldError) -> Self {
        Self {
            outcome: TaskOutcome::Failed(error),
            published: None,
        }
    }

    pub(crate) fn published(&self) -> TaskOutcome {
        self.published
            .clone()
            .unwrap_or_else(|| self.outcome.clone())
    }
}

/// Runs one field to its transformed value.
pub(crate) async fn run_field(ctx: &RunContext<'_>, task: &FetchTask, parent: &Value) -> FieldResult {
    match run(ctx, task, parent).await {
        Ok(result) => result,
        Err(error) => {
            debug!(task_id = task.id.as_raw(), path = %task.path, error = %error.message, "field failed");
            FieldResult::failed(error)
        }
    }
}

async fn run(ctx: &RunContext<'_>, task: &FetchTask, parent: &Value) -> Result<FieldResult, FieldError> {
    let field = &task.field.directives;
    if ctx.is_skipped(task)? {
        debug!(task_id = task.id.as_raw(), path = %task.path, "skipped");
        return Ok(FieldResult::absent());
    }

    let mut arguments = FetchArgs::from(task.field.arguments.clone());
    for consume in &field.consumes {
        let value = ctx.consume(task, consume, &arguments).await?;
        arguments.set(consume.argument.clone(), value);
    }

    let mut value = match &field.mock {
        Some(mock) => ctx.evaluate(directives::MOCK, &mock.value, &ctx.argument_env(&arguments))?,
        None => ctx.fetch(task, parent, arguments).await?,
    };

    let env = ctx.transform_env();
    for directive in &field.transforms {
        value = ctx.transforms.apply(value, directive, &env)?;
    }

    let published = match &field.publish {
        Some(publish) if publish.convert.is_some() => {
            Some(TaskOutcome::Resolved(ctx.publish(publish, &value)?))
        }
        _ => None,
    };
    Ok(FieldResult {
        outcome: TaskOutcome::Resolved(value),
        published,
    })
}
