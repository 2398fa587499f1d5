//! Per-execution task state.

use crate::error::{codes, FieldError, SchedulingInvariantViolation};
use crate::graph::{TaskGraph, TaskId};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// How a task finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Resolved(Value),
    /// Skipped, or never reached.
    Absent,
    Failed(FieldError),
}

impl TaskOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The value, with `Absent` as null.
    pub fn value(&self) -> Option<Value> {
        match self {
            Self::Resolved(value) => Some(value.clone()),
            Self::Absent => Some(Value::Null),
            Self::Failed(_) => None,
        }
    }
}

/// Single-assignment cell a source's consumers wait on.
#[derive(Debug)]
pub struct TaskSlot {
    claimed: AtomicBool,
    tx: watch::Sender<Option<TaskOutcome>>,
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            claimed: AtomicBool::new(false),
            tx,
        }
    }

    /// Takes the right to write. Returns false if already taken.
    pub fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Writes the outcome, handing it back if one was already written.
    pub fn fulfil(&self, outcome: TaskOutcome) -> Result<(), TaskOutcome> {
        let mut pending = Some(outcome);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = pending.take();
            true
        });
        match pending {
            None => Ok(()),
            Some(rejected) => Err(rejected),
        }
    }

    pub fn peek(&self) -> Option<TaskOutcome> {
        self.tx.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits until the slot is written. The returned future does not borrow
    /// the slot: if the slot is dropped first, the wait ends as `CANCELLED`.
    pub fn wait(&self) -> impl Future<Output = TaskOutcome> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|current| current.clone());
            outcome.unwrap_or_else(|| {
                TaskOutcome::Failed(
                    FieldError::new("source was cancelled before it completed")
                        .with_code(codes::CANCELLED),
                )
            })
        }
    }
}

type Collector = Mutex<BTreeMap<Vec<usize>, Value>>;

/// Slots and list collectors for one execution of a graph.
#[derive(Debug)]
pub struct ExecutionState {
    graph: Arc<TaskGraph>,
    slots: Vec<TaskSlot>,
    /// Per-element values of sources inside lists, keyed by list indices.
    collectors: FxHashMap<TaskId, Collector>,
}

impl ExecutionState {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        let slots = graph.tasks().iter().map(|_| TaskSlot::new()).collect();
        let collectors = graph
            .tasks()
            .iter()
            .filter(|task| task.is_list_root())
            .flat_map(|root| graph.list_sources(root.id).iter().copied())
            .map(|source| (source, Mutex::new(BTreeMap::new())))
            .collect();
        Self {
            graph,
            slots,
            collectors,
        }
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn slot(&self, id: TaskId) -> &TaskSlot {
        &self.slots[id.index()]
    }

    /// Writes a task's slot. A second write is an invariant violation.
    pub fn fulfil(
        &self,
        id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<(), SchedulingInvariantViolation> {
        self.slot(id)
            .fulfil(outcome)
            .map_err(|_| SchedulingInvariantViolation::DoubleWrite {
                path: self.graph.task(id).path.clone(),
            })
    }

    /// Claims and writes a slot nobody has claimed. Returns whether it wrote.
    pub fn complete_if_pending(&self, id: TaskId, outcome: TaskOutcome) -> bool {
        let slot = self.slot(id);
        slot.claim() && slot.fulfil(outcome).is_ok()
    }

    /// Records one element's value of a source inside a list.
    pub async fn collect(&self, source: TaskId, indices: Vec<usize>, value: Value) {
        if let Some(collector) = self.collectors.get(&source) {
            collector.lock().await.insert(indices, value);
        }
    }

    /// Publishes the sources collected under a finished list root. With
    /// `present` false the root produced no list and the sources are absent.
    pub async fn seal(
        &self,
        root: TaskId,
        present: bool,
        flatten: bool,
    ) -> Result<(), SchedulingInvariantViolation> {
        for &source in self.graph.list_sources(root) {
            let outcome = if present {
                TaskOutcome::Resolved(self.drain(source, flatten).await)
            } else {
                TaskOutcome::Absent
            };
            debug!(
                task_id = source.as_raw(),
                source = ?self.graph.task(source).source_name,
                present,
                "sealing list source"
            );
            if !self.slot(source).claim() {
                return Err(SchedulingInvariantViolation::DoubleWrite {
                    path: self.graph.task(source).path.clone(),
                });
            }
            self.fulfil(source, outcome)?;
        }
        Ok(())
    }

    async fn drain(&self, source: TaskId, flatten: bool) -> Value {
        let Some(collector) = self.collectors.get(&source) else {
            return Value::Array(Vec::new());
        };
        let collected = std::mem::take(&mut *collector.lock().await);
        let mut values = Vec::with_capacity(collected.len());
        for value in collected.into_values() {
            match value {
                Value::Array(items) if flatten => values.extend(items),
                value => values.push(value),
            }
        }
        Value::Array(values)
    }

    /// Completes every unpublished slot under `id` so nothing waits on work
    /// that will never run.
    pub fn abandon(&self, id: TaskId) {
        for task in self.graph.subtree(id) {
            if task.is_in_list {
                continue;
            }
            if self.complete_if_pending(task.id, TaskOutcome::Absent) && task.is_top_task {
                debug!(task_id = task.id.as_raw(), path = %task.path, "abandoned source");
            }
            if task.is_list_root() {
                for &source in self.graph.list_sources(task.id) {
                    self.complete_if_pending(source, TaskOutcome::Absent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcql_semantic::hir::{DirectiveBinding, Field, Operation, TypeRef};
    use serde_json::json;

    #[tokio::test]
    async fn test_slot_single_assignment() {
        let slot = Arc::new(TaskSlot::new());
        assert!(slot.claim());
        assert!(!slot.claim());

        let reader = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.wait().await })
        };
        slot.fulfil(TaskOutcome::Resolved(json!(1))).unwrap();
        assert_eq!(reader.await.unwrap(), TaskOutcome::Resolved(json!(1)));

        assert_eq!(
            slot.fulfil(TaskOutcome::Absent),
            Err(TaskOutcome::Absent)
        );
        assert_eq!(slot.peek(), Some(TaskOutcome::Resolved(json!(1))));
    }

    #[tokio::test]
    async fn test_dropped_slot_cancels_readers() {
        let slot = TaskSlot::new();
        let reader = tokio::spawn(slot.wait());
        tokio::task::yield_now().await;
        drop(slot);

        let TaskOutcome::Failed(error) = reader.await.unwrap() else {
            panic!("expected a cancelled outcome");
        };
        assert_eq!(error.code(), Some(codes::CANCELLED));
    }

    fn list_graph() -> Arc<TaskGraph> {
        let operation = Operation::new().field(
            Field::new("items", "Query")
                .returns(TypeRef::list("Item"))
                .field(
                    Field::new("tags", "Item")
                        .returns(TypeRef::list("String"))
                        .directive(DirectiveBinding::new("publishSource").arg("name", "tags")),
                ),
        );
        Arc::new(TaskGraph::build(&operation))
    }

    #[tokio::test]
    async fn test_seal_orders_by_index() {
        let graph = list_graph();
        let root = graph.task_by_path("items").unwrap();
        let tags = graph.task_by_path("items#tags").unwrap();

        let state = ExecutionState::new(Arc::clone(&graph));
        state.collect(tags, vec![1], json!(["b"])).await;
        state.collect(tags, vec![0], json!(["a", "c"])).await;
        state.seal(root, true, false).await.unwrap();
        assert_eq!(
            state.slot(tags).wait().await,
            TaskOutcome::Resolved(json!([["a", "c"], ["b"]]))
        );

        let flat = ExecutionState::new(graph);
        flat.collect(tags, vec![1], json!(["b"])).await;
        flat.collect(tags, vec![0], json!(["a", "c"])).await;
        flat.seal(root, true, true).await.unwrap();
        assert_eq!(
            flat.slot(tags).peek(),
            Some(TaskOutcome::Resolved(json!(["a", "c", "b"])))
        );
    }

    #[tokio::test]
    async fn test_abandon_completes_sources() {
        let graph = list_graph();
        let root = graph.task_by_path("items").unwrap();
        let tags = graph.task_by_path("items#tags").unwrap();

        let state = ExecutionState::new(graph);
        state.abandon(root);
        assert_eq!(state.slot(tags).peek(), Some(TaskOutcome::Absent));
        assert_eq!(state.slot(root).peek(), Some(TaskOutcome::Absent));
    }

    #[test]
    fn test_double_write_is_violation() {
        let state = ExecutionState::new(list_graph());
        let root = TaskId::from_raw(0);
        state.fulfil(root, TaskOutcome::Absent).unwrap();
        assert_eq!(
            state.fulfil(root, TaskOutcome::Absent),
            Err(SchedulingInvariantViolation::DoubleWrite {
                path: "items".to_string()
            })
        );
    }
}
