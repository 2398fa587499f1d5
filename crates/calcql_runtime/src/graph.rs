//! Task graph construction.
//!
//! A [`TaskGraph`] is built once per query shape. It interns every field
//! path to a dense [`TaskId`], records which task publishes each source, and
//! keeps the decoded directives the scheduler needs. It is immutable after
//! [`TaskGraph::build`] and shared between executions.

use calcql_semantic::directives::{DirectiveRegistry, FieldDirectives};
use calcql_semantic::hir::{merge_fields, MergedField, Operation, Selection, TypeRef};
use calcql_semantic::path;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::{self, Write as _};
use tracing::{debug, warn};

/// Index of a task in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    /// Creates a TaskId from a raw value.
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The field a task fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub parent_type: String,
    pub return_type: TypeRef,
    /// Literal arguments, before any source rewriting.
    pub arguments: IndexMap<String, Value>,
    pub directives: FieldDirectives,
}

/// One field of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub id: TaskId,
    /// `#`-joined response keys from the root.
    pub path: String,
    pub parent: Option<TaskId>,
    pub depth: u32,
    /// Name this field publishes, if any.
    pub source_name: Option<String>,
    pub is_list_type: bool,
    /// Whether some ancestor is list-typed.
    pub is_in_list: bool,
    /// Outermost list-typed ancestor.
    pub list_root: Option<TaskId>,
    /// Whether consumers of `source_name` wait on this task.
    pub is_top_task: bool,
    /// Response key.
    pub mapper_key: String,
    pub children: Vec<TaskId>,
    /// End (exclusive) of this task's subtree; tasks are stored depth first.
    pub subtree_end: TaskId,
    pub field: FieldSpec,
}

impl FetchTask {
    /// A list field that is not itself inside a list.
    pub fn is_list_root(&self) -> bool {
        self.is_list_type && !self.is_in_list
    }
}

/// The immutable dependency index of a query.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    /// Every publisher of each source name, in declaration order.
    query_task_by_source_name: IndexMap<String, Vec<TaskId>>,
    /// The publisher consumers wait on.
    top_task_by_source_name: FxHashMap<String, TaskId>,
    fetch_source_task_by_path: IndexMap<String, TaskId>,
    /// In-list top sources keyed by their list root.
    list_sources: FxHashMap<TaskId, Vec<TaskId>>,
    tasks: Vec<FetchTask>,
    roots: Vec<TaskId>,
}

impl TaskGraph {
    /// Builds the graph of an operation using the built-in directives.
    pub fn build(operation: &Operation) -> Self {
        Self::build_with(operation, &DirectiveRegistry::builtin())
    }

    /// Builds the graph of an operation. The operation is assumed valid.
    pub fn build_with(operation: &Operation, registry: &DirectiveRegistry) -> Self {
        let mut builder = GraphBuilder {
            registry,
            graph: Self::default(),
            published: Vec::new(),
        };
        builder.graph.roots = builder.visit(&operation.selection, None, None);
        let graph = builder.graph;

        debug!(
            tasks = graph.tasks.len(),
            sources = graph.top_task_by_source_name.len(),
            "built task graph"
        );
        graph
    }

    pub fn task(&self, id: TaskId) -> &FetchTask {
        &self.tasks[id.index()]
    }

    pub fn tasks(&self) -> &[FetchTask] {
        &self.tasks
    }

    /// Top-level tasks in declaration order.
    pub fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task consumers of `name` wait on.
    pub fn top_task(&self, name: &str) -> Option<TaskId> {
        self.top_task_by_source_name.get(name).copied()
    }

    /// Every task publishing `name`.
    pub fn publishers(&self, name: &str) -> &[TaskId] {
        self.query_task_by_source_name
            .get(name)
            .map_or(&[], Vec::as_slice)
    }

    pub fn task_by_path(&self, path: &str) -> Option<TaskId> {
        self.fetch_source_task_by_path.get(path).copied()
    }

    /// Top sources beneath a list root, published when the root finishes.
    pub fn list_sources(&self, root: TaskId) -> &[TaskId] {
        self.list_sources.get(&root).map_or(&[], Vec::as_slice)
    }

    /// The task and all of its descendants.
    pub fn subtree(&self, id: TaskId) -> &[FetchTask] {
        &self.tasks[id.index()..self.task(id).subtree_end.index()]
    }

    /// Renders the task table and source index.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for task in &self.tasks {
            let _ = write!(out, "{} {}", task.id, task.path);
            if task.is_list_type {
                out.push_str(" [list]");
            }
            if let Some(root) = task.list_root {
                let _ = write!(out, " in-list({root})");
            }
            if let Some(name) = &task.source_name {
                let marker = if task.is_top_task { "" } else { " (nested)" };
                let _ = write!(out, " publishes {name}{marker}");
            }
            for consume in &task.field.directives.consumes {
                let _ = write!(
                    out,
                    " consumes {}:{}->{}",
                    consume.name,
                    consume.operation.as_str(),
                    consume.argument
                );
            }
            out.push('\n');
        }
        if !self.query_task_by_source_name.is_empty() {
            out.push_str("sources:\n");
            for (name, publishers) in &self.query_task_by_source_name {
                let top = self
                    .top_task(name)
                    .map_or_else(|| "-".to_string(), |id| id.to_string());
                let all: Vec<String> = publishers.iter().map(ToString::to_string).collect();
                let _ = writeln!(out, "  {name} -> {top} [{}]", all.join(", "));
            }
        }
        out
    }
}

struct GraphBuilder<'r> {
    registry: &'r DirectiveRegistry,
    graph: TaskGraph,
    /// Source names published by the current ancestor chain.
    published: Vec<String>,
}

impl GraphBuilder<'_> {
    /// Fields sharing a response key merge into one task.
    fn visit<'q>(
        &mut self,
        selection: impl IntoIterator<Item = &'q Selection>,
        parent: Option<TaskId>,
        list_root: Option<TaskId>,
    ) -> Vec<TaskId> {
        merge_fields(selection)
            .iter()
            .map(|merged| self.visit_field(merged, parent, list_root))
            .collect()
    }

    fn visit_field(
        &mut self,
        merged: &MergedField<'_>,
        parent: Option<TaskId>,
        list_root: Option<TaskId>,
    ) -> TaskId {
        let field = merged.field();
        #[allow(clippy::cast_possible_truncation)]
        let id = TaskId(self.graph.tasks.len() as u32);
        let (path, depth) = match parent {
            Some(parent) => {
                let parent = self.graph.task(parent);
                (
                    path::join(Some(&parent.path), field.response_key()),
                    parent.depth + 1,
                )
            }
            None => (field.response_key().to_string(), 0),
        };

        let directives = FieldDirectives::parse(&merged.directives, self.registry).unwrap_or_else(|err| {
            warn!(path = %path, error = %err, "ignoring undecodable directives");
            FieldDirectives::default()
        });
        let source_name = directives.publish.as_ref().map(|p| p.name.clone());

        let is_top_task = match &source_name {
            Some(name) => {
                !self.published.contains(name)
                    && !self.graph.top_task_by_source_name.contains_key(name)
            }
            None => false,
        };
        if let Some(name) = &source_name {
            self.graph
                .query_task_by_source_name
                .entry(name.clone())
                .or_default()
                .push(id);
            if is_top_task {
                self.graph.top_task_by_source_name.insert(name.clone(), id);
                if let Some(root) = list_root {
                    self.graph.list_sources.entry(root).or_default().push(id);
                }
            }
        }

        self.graph.fetch_source_task_by_path.insert(path.clone(), id);
        self.graph.tasks.push(FetchTask {
            id,
            path,
            parent,
            depth,
            source_name: source_name.clone(),
            is_list_type: field.return_type.list,
            is_in_list: list_root.is_some(),
            list_root,
            is_top_task,
            mapper_key: field.response_key().to_string(),
            children: Vec::new(),
            subtree_end: id,
            field: FieldSpec {
                name: field.name.clone(),
                parent_type: field.parent_type.clone(),
                return_type: field.return_type.clone(),
                arguments: field.argument_values(),
                directives,
            },
        });

        if let Some(name) = &source_name {
            self.published.push(name.clone());
        }
        let child_root = list_root.or(field.return_type.list.then_some(id));
        let children = self.visit(merged.selection.iter().copied(), Some(id), child_root);
        if source_name.is_some() {
            self.published.pop();
        }

        #[allow(clippy::cast_possible_truncation)]
        let end = TaskId(self.graph.tasks.len() as u32);
        let task = &mut self.graph.tasks[id.index()];
        task.children = children;
        task.subtree_end = end;
        id
    }
}
