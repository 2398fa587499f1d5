//! Validation of calculation directives on a query.
//!
//! The checker decodes every directive binding, compiles every expression,
//! resolves consumed sources against published ones and rejects dependency
//! cycles. Execution never starts on a query with errors.

use crate::directives::{DirectiveRegistry, FieldDirectives};
use crate::hir::{merge_fields, DirectiveBinding, Field, Operation, Selection};
use crate::path;
use calcql_core::{codes, Diagnostic, DiagnosticBag};
use calcql_expr::{ExpressionEngine, ELEMENT};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use tracing::debug;

/// Result of checking an operation.
#[derive(Debug, Default)]
pub struct CheckResult {
    pub diagnostics: DiagnosticBag,
}

impl CheckResult {
    /// Returns true if validation succeeded.
    pub fn is_ok(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

/// One field occurrence in depth-first order.
struct FieldNode<'q> {
    path: String,
    field: &'q Field,
    parent: Option<usize>,
    directives: FieldDirectives,
    /// Outermost list-typed ancestor.
    list_root: Option<usize>,
    /// Exclusive end of this field's subtree in the node list.
    subtree_end: usize,
}

/// Validator for calculation directives.
pub struct Checker<'a> {
    registry: &'a DirectiveRegistry,
    engine: &'a dyn ExpressionEngine,
    diagnostics: DiagnosticBag,
}

impl<'a> Checker<'a> {
    /// Creates a new checker.
    pub fn new(registry: &'a DirectiveRegistry, engine: &'a dyn ExpressionEngine) -> Self {
        Self {
            registry,
            engine,
            diagnostics: DiagnosticBag::new(),
        }
    }

    /// Checks an operation.
    pub fn check(&mut self, operation: &Operation) -> CheckResult {
        let mut nodes = Vec::new();
        self.collect(&operation.selection, None, None, &mut nodes);

        let variables: FxHashSet<&str> = operation
            .variables
            .iter()
            .map(|v| v.name.as_str())
            .collect();

        let top = self.check_sources(&nodes);
        for node in &nodes {
            self.check_consumers(node, &top, &variables);
            self.check_conditions(node, &variables);
        }
        self.check_unused_sources(&nodes, &top);
        self.check_cycles(&nodes, &top);

        debug!(
            fields = nodes.len(),
            sources = top.len(),
            errors = self.diagnostics.error_count(),
            "checked operation"
        );

        CheckResult {
            diagnostics: std::mem::take(&mut self.diagnostics),
        }
    }

    /// Fields sharing a response key are checked as one node, the same way
    /// the task graph merges them.
    fn collect<'q>(
        &mut self,
        selection: impl IntoIterator<Item = &'q Selection>,
        parent: Option<usize>,
        list_root: Option<usize>,
        nodes: &mut Vec<FieldNode<'q>>,
    ) {
        for merged in merge_fields(selection) {
            let field = merged.field();
            let index = nodes.len();
            let path = path::join(parent.map(|p| nodes[p].path.as_str()), field.response_key());
            if let Some(other) = merged.conflict() {
                self.diagnostics.error(
                    codes::CONFLICTING_FIELDS,
                    "Conflicting fields",
                    &path,
                    format!(
                        "`{}` and `{}` share the response key `{}` but differ in name, arguments or type",
                        field.name,
                        other.name,
                        field.response_key()
                    ),
                );
            }
            let directives = self.check_directives(&merged.directives, &path);

            nodes.push(FieldNode {
                path,
                field,
                parent,
                directives,
                list_root,
                subtree_end: index + 1,
            });

            let child_root = list_root.or(field.return_type.list.then_some(index));
            self.collect(merged.selection.iter().copied(), Some(index), child_root, nodes);
            nodes[index].subtree_end = nodes.len();
        }
    }

    fn check_directives(&mut self, bindings: &[DirectiveBinding], path: &str) -> FieldDirectives {
        let mut directives = FieldDirectives::default();
        let mut seen = FxHashSet::default();

        for binding in bindings {
            let Some(definition) = self.registry.get(&binding.name) else {
                self.diagnostics.error(
                    codes::UNKNOWN_DIRECTIVE,
                    "Unknown directive",
                    path,
                    format!("`@{}` is not a calculation directive", binding.name),
                );
                continue;
            };
            if !definition.repeatable && !seen.insert(binding.name.as_str()) {
                self.diagnostics.error(
                    codes::DUPLICATE_DIRECTIVE,
                    "Duplicate directive",
                    path,
                    format!("`@{}` may appear once per field", binding.name),
                );
                continue;
            }

            match self.registry.parse(binding) {
                Ok(directive) => {
                    for source in directive.expressions() {
                        let result = self.engine.validate(source);
                        if result.ok {
                            continue;
                        }
                        let message = result.message.unwrap_or_default();
                        let mut diagnostic =
                            Diagnostic::error(codes::INVALID_EXPRESSION, "Invalid expression")
                                .with_path(path)
                                .with_message(format!(
                                    "`{source}` in `@{}`: {message}",
                                    binding.name
                                ));
                        if let Some(span) = result.span {
                            diagnostic = diagnostic.with_span(span, message);
                        }
                        self.diagnostics.add(diagnostic);
                    }
                    directives.push(directive);
                }
                Err(err) => self.diagnostics.error(
                    codes::INVALID_DIRECTIVE_ARGUMENT,
                    "Invalid directive argument",
                    path,
                    err.to_string(),
                ),
            }
        }

        directives
    }

    /// Resolves the top publisher of every source name.
    fn check_sources<'q>(&mut self, nodes: &'q [FieldNode<'_>]) -> IndexMap<&'q str, usize> {
        let mut top: IndexMap<&str, usize> = IndexMap::new();

        for (index, node) in nodes.iter().enumerate() {
            let Some(publish) = &node.directives.publish else {
                continue;
            };
            if ancestor_publishes(nodes, node.parent, &publish.name) {
                continue;
            }
            if let Some(&first) = top.get(publish.name.as_str()) {
                self.diagnostics.error(
                    codes::DUPLICATE_SOURCE,
                    "Duplicate source",
                    &node.path,
                    format!(
                        "source `{}` is already published at `{}`",
                        publish.name, nodes[first].path
                    ),
                );
                continue;
            }
            top.insert(publish.name.as_str(), index);
        }

        top
    }

    fn check_consumers(
        &mut self,
        node: &FieldNode<'_>,
        top: &IndexMap<&str, usize>,
        variables: &FxHashSet<&str>,
    ) {
        for consume in &node.directives.consumes {
            if !top.contains_key(consume.name.as_str()) {
                self.diagnostics.error(
                    codes::UNDEFINED_SOURCE,
                    "Undefined source",
                    &node.path,
                    format!("no field publishes source `{}`", consume.name),
                );
            }

            match node.field.get_argument(&consume.argument) {
                None => self.diagnostics.error(
                    codes::UNKNOWN_ARGUMENT,
                    "Unknown argument",
                    &node.path,
                    format!(
                        "`{}` has no argument `{}`",
                        node.field.name, consume.argument
                    ),
                ),
                Some(argument) if consume.operation.is_list() && !argument.is_list() => {
                    self.diagnostics.error(
                        codes::LIST_MISMATCH,
                        "List operation on non-list argument",
                        &node.path,
                        format!(
                            "`{}` on argument `{}` requires a list argument",
                            consume.operation.as_str(),
                            consume.argument
                        ),
                    );
                }
                Some(_) => {}
            }

            let mut allowed: FxHashSet<&str> = variables.clone();
            allowed.insert(consume.name.as_str());
            allowed.extend(node.field.arguments.iter().map(|a| a.name.as_str()));
            if consume.operation.is_list() {
                allowed.insert(ELEMENT);
            }
            self.check_variables(&node.path, &consume.expression, &allowed);
        }

        if let Some(publish) = &node.directives.publish {
            if let Some(convert) = &publish.convert {
                let mut allowed: FxHashSet<&str> = variables.clone();
                allowed.insert(publish.name.as_str());
                allowed.insert(ELEMENT);
                self.check_variables(&node.path, convert, &allowed);
            }
        }

        if let Some(mock) = &node.directives.mock {
            let mut allowed: FxHashSet<&str> = variables.clone();
            allowed.extend(node.field.arguments.iter().map(|a| a.name.as_str()));
            self.check_variables(&node.path, &mock.value, &allowed);
        }
    }

    fn check_unused_sources(&mut self, nodes: &[FieldNode<'_>], top: &IndexMap<&str, usize>) {
        let consumed: FxHashSet<&str> = nodes
            .iter()
            .flat_map(|node| &node.directives.consumes)
            .map(|consume| consume.name.as_str())
            .collect();
        for (name, &index) in top {
            if !consumed.contains(name) {
                self.diagnostics.warning(
                    codes::UNUSED_SOURCE,
                    "Unused source",
                    &nodes[index].path,
                    format!("no field consumes source `{name}`"),
                );
            }
        }
    }

    fn check_conditions(&mut self, node: &FieldNode<'_>, variables: &FxHashSet<&str>) {
        for condition in [&node.directives.skip_if, &node.directives.include_if]
            .into_iter()
            .flatten()
        {
            self.check_variables(&node.path, condition, variables);
        }
    }

    fn check_variables(&mut self, path: &str, source: &str, allowed: &FxHashSet<&str>) {
        // Compile failures were reported when the directive was decoded.
        let Ok(names) = self.engine.free_variables(source) else {
            return;
        };
        for name in names {
            if !allowed.contains(name.as_str()) {
                self.diagnostics.error(
                    codes::UNDEFINED_VARIABLE,
                    "Undefined variable",
                    path,
                    format!("`{name}` in `{source}` is not bound"),
                );
            }
        }
    }

    fn check_cycles(&mut self, nodes: &[FieldNode<'_>], top: &IndexMap<&str, usize>) {
        let graph = DependencyGraph::build(nodes, top);
        let mut reported = BTreeSet::new();

        for cycle in graph.cycles() {
            let Some(&first) = cycle.iter().find(|&&n| n < nodes.len()) else {
                continue;
            };
            if !reported.insert(first) {
                continue;
            }
            let trail: Vec<String> = cycle
                .iter()
                .chain(std::iter::once(&cycle[0]))
                .map(|&n| graph.label(n, nodes))
                .collect();
            self.diagnostics.error(
                codes::CYCLE,
                "Dependency cycle",
                &nodes[first].path,
                trail.join(" -> "),
            );
        }
    }
}

fn ancestor_publishes(nodes: &[FieldNode<'_>], mut parent: Option<usize>, name: &str) -> bool {
    while let Some(index) = parent {
        let node = &nodes[index];
        if node.directives.publish.as_ref().is_some_and(|p| p.name == name) {
            return true;
        }
        parent = node.parent;
    }
    false
}

/// Wait-for graph over field fetches and source readiness.
///
/// Node `i < fields` is "field `i` may fetch"; node `fields + k` is "the
/// `k`-th source is published".
struct DependencyGraph<'t> {
    fields: usize,
    sources: Vec<&'t str>,
    edges: Vec<Vec<usize>>,
}

impl<'t> DependencyGraph<'t> {
    fn build(nodes: &[FieldNode<'_>], top: &IndexMap<&'t str, usize>) -> Self {
        let fields = nodes.len();
        let source_ids: FxHashMap<&str, usize> = top
            .keys()
            .enumerate()
            .map(|(k, name)| (*name, fields + k))
            .collect();
        let mut edges = vec![Vec::new(); fields + top.len()];

        for (index, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                edges[index].push(parent);
            }
            for consume in &node.directives.consumes {
                if let Some(&ready) = source_ids.get(consume.name.as_str()) {
                    edges[index].push(ready);
                }
            }
        }

        for (k, &publisher) in top.values().enumerate() {
            let ready = &mut edges[fields + k];
            match nodes[publisher].list_root {
                // In-list sources are published once the whole list is done.
                Some(root) => ready.extend(root..nodes[root].subtree_end),
                None => ready.push(publisher),
            }
        }

        Self {
            fields,
            sources: top.keys().copied().collect(),
            edges,
        }
    }

    /// One cycle per back edge found by a depth-first search.
    fn cycles(&self) -> Vec<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        let mut marks = vec![Mark::New; self.edges.len()];
        let mut stack: Vec<usize> = Vec::new();
        let mut cycles = Vec::new();

        for start in 0..self.edges.len() {
            if marks[start] != Mark::New {
                continue;
            }
            // (node, next edge to visit)
            let mut work = vec![(start, 0usize)];
            marks[start] = Mark::Active;
            stack.push(start);

            while let Some(frame) = work.last_mut() {
                let node = frame.0;
                if let Some(&target) = self.edges[node].get(frame.1) {
                    frame.1 += 1;
                    match marks[target] {
                        Mark::New => {
                            marks[target] = Mark::Active;
                            stack.push(target);
                            work.push((target, 0));
                        }
                        Mark::Active => {
                            if let Some(pos) = stack.iter().position(|&n| n == target) {
                                cycles.push(stack[pos..].to_vec());
                            }
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    work.pop();
                }
            }
        }

        cycles
    }

    fn label(&self, node: usize, nodes: &[FieldNode<'_>]) -> String {
        if node < self.fields {
            nodes[node].path.clone()
        } else {
            format!("@{}", self.sources[node - self.fields])
        }
    }
}

/// Checks an operation against a directive registry.
pub fn check(
    operation: &Operation,
    registry: &DirectiveRegistry,
    engine: &dyn ExpressionEngine,
) -> CheckResult {
    let mut checker = Checker::new(registry, engine);
    checker.check(operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::{CONSUME_SOURCE, PUBLISH_SOURCE, SKIP_IF, SORT_BY};
    use crate::hir::{DirectiveBinding, InlineFragment, TypeRef};
    use calcql_expr::Calculator;
    use serde_json::{json, Value};

    fn run(operation: &Operation) -> CheckResult {
        check(operation, &DirectiveRegistry::builtin(), &Calculator::new())
    }

    fn publish(name: &str) -> DirectiveBinding {
        DirectiveBinding::new(PUBLISH_SOURCE).arg("name", name)
    }

    fn consume(argument: &str, name: &str, operation: &str, expression: &str) -> DirectiveBinding {
        DirectiveBinding::new(CONSUME_SOURCE)
            .arg("argument", argument)
            .arg("name", name)
            .arg("operation", operation)
            .arg("expression", expression)
    }

    fn user_items() -> Operation {
        Operation::new()
            .field(
                Field::new("userInfo", "Query")
                    .returns(TypeRef::named("User"))
                    .field(
                        Field::new("itemIds", "User")
                            .returns(TypeRef::list("Int"))
                            .directive(publish("itemIds")),
                    ),
            )
            .field(
                Field::new("items", "Query")
                    .returns(TypeRef::list("Item"))
                    .list_argument("ids", Value::Null)
                    .directive(consume("ids", "itemIds", "LIST_MAP", "ele"))
                    .field(Field::new("name", "Item")),
            )
    }

    #[test]
    fn test_valid_query() {
        let result = run(&user_items());
        assert!(result.is_ok(), "{}", result.diagnostics);
    }

    #[test]
    fn test_unknown_and_duplicate_directives() {
        let operation = Operation::new().field(
            Field::new("items", "Query")
                .directive(DirectiveBinding::new("cached"))
                .directive(DirectiveBinding::new(SORT_BY).arg("key", "a"))
                .directive(DirectiveBinding::new(SORT_BY).arg("key", "b")),
        );
        let result = run(&operation);
        assert!(result.diagnostics.contains_code(codes::UNKNOWN_DIRECTIVE));
        assert!(result.diagnostics.contains_code(codes::DUPLICATE_DIRECTIVE));
    }

    #[test]
    fn test_invalid_expression_is_labelled() {
        let operation = Operation::new().field(
            Field::new("items", "Query")
                .directive(DirectiveBinding::new("filter").arg("predicate", "size(ele) >")),
        );
        let result = run(&operation);
        let diagnostic = result.diagnostics.errors().next().unwrap();
        assert_eq!(diagnostic.code, codes::INVALID_EXPRESSION);
        assert_eq!(diagnostic.labels.len(), 1);
        let span = diagnostic.primary_span().unwrap();
        assert!(span.end as usize <= "size(ele) >".len());
    }

    #[test]
    fn test_unused_source_is_a_warning() {
        let operation = Operation::new()
            .field(Field::new("total", "Query").directive(publish("total")))
            .field(Field::new("count", "Query").directive(publish("count")))
            .field(
                Field::new("page", "Query")
                    .argument("size", json!(10))
                    .directive(consume("size", "total", "MAP", "total")),
            );
        let result = run(&operation);
        assert!(result.is_ok(), "{}", result.diagnostics);
        let warnings: Vec<_> = result.diagnostics.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, codes::UNUSED_SOURCE);
        assert_eq!(warnings[0].location_path.as_deref(), Some("count"));
    }

    #[test]
    fn test_invalid_argument_and_expression() {
        let operation = Operation::new().field(
            Field::new("items", "Query")
                .directive(DirectiveBinding::new(PUBLISH_SOURCE))
                .directive(DirectiveBinding::new("filter").arg("predicate", "ele.price >")),
        );
        let result = run(&operation);
        assert!(result.diagnostics.contains_code(codes::INVALID_DIRECTIVE_ARGUMENT));
        assert!(result.diagnostics.contains_code(codes::INVALID_EXPRESSION));
    }

    #[test]
    fn test_undefined_source_and_unknown_argument() {
        let operation = Operation::new().field(
            Field::new("items", "Query").directive(consume("ids", "missing", "MAP", "missing")),
        );
        let result = run(&operation);
        let found: Vec<_> = result.diagnostics.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(found, vec![codes::UNDEFINED_SOURCE, codes::UNKNOWN_ARGUMENT]);
        assert_eq!(
            result.diagnostics.iter().next().unwrap().location_path.as_deref(),
            Some("items")
        );
    }

    #[test]
    fn test_duplicate_sources() {
        let operation = Operation::new()
            .field(Field::new("a", "Query").directive(publish("s")))
            .field(Field::new("b", "Query").directive(publish("s")));
        let result = run(&operation);
        let diagnostic = result.diagnostics.errors().next().unwrap();
        assert_eq!(diagnostic.code, codes::DUPLICATE_SOURCE);
        assert_eq!(diagnostic.location_path.as_deref(), Some("b"));
    }

    #[test]
    fn test_nested_republish_is_allowed() {
        let operation = Operation::new().field(
            Field::new("a", "Query")
                .returns(TypeRef::named("A"))
                .directive(publish("s"))
                .field(Field::new("b", "A").directive(publish("s"))),
        );
        assert!(run(&operation).is_ok());
    }

    #[test]
    fn test_list_mismatch() {
        let operation = Operation::new()
            .field(Field::new("ids", "Query").directive(publish("ids")))
            .field(
                Field::new("item", "Query")
                    .argument("id", json!(0))
                    .directive(consume("id", "ids", "FILTER", "ele > 1")),
            );
        assert!(run(&operation).diagnostics.contains_code(codes::LIST_MISMATCH));
    }

    #[test]
    fn test_undefined_variables() {
        let operation = Operation::new()
            .variable("limit")
            .field(Field::new("total", "Query").directive(publish("total")))
            .field(
                Field::new("page", "Query")
                    .argument("size", json!(10))
                    .argument("offset", json!(0))
                    .directive(consume("offset", "total", "MAP", "total - size - limit - ele"))
                    .directive(DirectiveBinding::new(SKIP_IF).arg("expression", "hidden")),
            );
        let result = run(&operation);
        let messages: Vec<_> = result
            .diagnostics
            .iter()
            .map(|d| d.message.clone().unwrap_or_default())
            .collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages[0].contains("`ele`"));
        assert!(messages[1].contains("`hidden`"));
    }

    #[test]
    fn test_self_consumption_is_a_cycle() {
        let operation = Operation::new().field(
            Field::new("counter", "Query")
                .argument("n", json!(0))
                .directive(publish("count"))
                .directive(consume("n", "count", "MAP", "count + 1")),
        );
        let result = run(&operation);
        let diagnostic = result.diagnostics.errors().next().unwrap();
        assert_eq!(diagnostic.code, codes::CYCLE);
        insta::assert_snapshot!(
            diagnostic.message.clone().unwrap(),
            @"counter -> @count -> counter"
        );
    }

    #[test]
    fn test_mutual_dependency_is_a_cycle() {
        let operation = Operation::new()
            .field(
                Field::new("a", "Query")
                    .argument("x", json!(0))
                    .directive(publish("a"))
                    .directive(consume("x", "b", "MAP", "b")),
            )
            .field(
                Field::new("b", "Query")
                    .argument("y", json!(0))
                    .directive(publish("b"))
                    .directive(consume("y", "a", "MAP", "a")),
            );
        let result = run(&operation);
        assert_eq!(result.diagnostics.error_count(), 1);
        assert!(result.diagnostics.contains_code(codes::CYCLE));
    }

    #[test]
    fn test_consumer_inside_source_list_is_a_cycle() {
        let operation = Operation::new().field(
            Field::new("orders", "Query")
                .returns(TypeRef::list("Order"))
                .field(Field::new("id", "Order").directive(publish("orderIds")))
                .field(
                    Field::new("related", "Order")
                        .list_argument("ids", Value::Null)
                        .directive(consume("ids", "orderIds", "MAP", "orderIds")),
                ),
        );
        assert!(run(&operation).diagnostics.contains_code(codes::CYCLE));
    }

    #[test]
    fn test_consumer_below_ancestor_source() {
        let operation = Operation::new().field(
            Field::new("user", "Query")
                .returns(TypeRef::named("User"))
                .directive(publish("user"))
                .field(
                    Field::new("friends", "User")
                        .argument("first", json!(1))
                        .directive(consume("first", "user", "MAP", "size(user.friendIds)")),
                ),
        );
        let result = run(&operation);
        assert!(result.is_ok(), "{}", result.diagnostics);
    }

    fn config_copies(second: DirectiveBinding) -> Operation {
        Operation::new()
            .field(Field::new("config", "Query").field(Field::new("limit", "Config")))
            .select(Selection::InlineFragment(InlineFragment {
                type_condition: None,
                selection: vec![Selection::Field(
                    Field::new("config", "Query")
                        .directive(second)
                        .field(Field::new("limit", "Config")),
                )],
            }))
            .field(
                Field::new("echo", "Query")
                    .argument("value", Value::Null)
                    .directive(consume("value", "config", "MAP", "config.limit")),
            )
    }

    #[test]
    fn test_same_key_copies_are_checked_as_one_field() {
        let result = run(&config_copies(publish("config")));
        assert!(result.is_ok(), "{}", result.diagnostics);
    }

    #[test]
    fn test_same_key_copies_with_two_publishers() {
        let operation = config_copies(publish("settings")).field(
            Field::new("config", "Query")
                .directive(publish("config"))
                .field(Field::new("limit", "Config")),
        );
        let result = run(&operation);
        let diagnostic = result.diagnostics.errors().next().unwrap();
        assert_eq!(diagnostic.code, codes::DUPLICATE_DIRECTIVE);
        assert_eq!(diagnostic.location_path.as_deref(), Some("config"));
    }

    #[test]
    fn test_same_key_copies_with_different_arguments() {
        let operation = Operation::new()
            .field(Field::new("item", "Query").argument("id", json!(1)))
            .field(Field::new("item", "Query").argument("id", json!(2)));
        let result = run(&operation);
        assert_eq!(result.diagnostics.error_count(), 1);
        assert!(result.diagnostics.contains_code(codes::CONFLICTING_FIELDS));
    }
}
