//! Value transforms applied to fetched values.
//!
//! Each transform directive is served by a [`TransformHandler`]. The
//! [`TransformRegistry`] picks the handler by directive name and caches the
//! choice so lookups after the first are a read-locked map hit.

use crate::error::TransformError;
use crate::projector::{element_env, ValueProjector};
use calcql_expr::{compare_values, Environment, ExpressionEngine};
use calcql_semantic::directives::{self, FieldDirective};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

/// What a transform handler evaluates against.
pub struct TransformEnv<'a> {
    pub engine: &'a dyn ExpressionEngine,
    pub projector: &'a dyn ValueProjector,
    /// Query variables.
    pub variables: &'a Environment,
}

impl TransformEnv<'_> {
    fn element(&self, element: &Value) -> Environment {
        element_env(self.projector, self.variables, element)
    }

    fn evaluate(
        &self,
        directive: &'static str,
        source: &str,
        env: &Environment,
    ) -> Result<Value, TransformError> {
        self.engine
            .evaluate(source, env)
            .map_err(|source| TransformError::Evaluation { directive, source })
    }

    fn predicate(
        &self,
        directive: &'static str,
        source: &str,
        env: &Environment,
    ) -> Result<bool, TransformError> {
        self.engine
            .evaluate_predicate(source, env)
            .map_err(|source| TransformError::Evaluation { directive, source })
    }
}

/// Post-processes a field value for one directive.
pub trait TransformHandler: Send + Sync {
    /// Whether this handler serves the named directive.
    fn supports(&self, name: &str) -> bool;

    /// Whether the handler only applies to lists. Other values pass through.
    fn is_collection(&self) -> bool {
        true
    }

    fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError>;
}

/// `@filter(predicate)`: keeps elements the predicate holds for.
pub struct FilterHandler;

impl TransformHandler for FilterHandler {
    fn supports(&self, name: &str) -> bool {
        name == directives::FILTER
    }

    fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError> {
        let (FieldDirective::Filter(filter), Value::Array(items)) = (directive, &value) else {
            return Ok(value);
        };
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if env.predicate(directives::FILTER, &filter.predicate, &env.element(item))? {
                kept.push(item.clone());
            }
        }
        Ok(Value::Array(kept))
    }
}

/// `@sortBy(key, comparator, reversed)`: stable sort, nulls last.
pub struct SortByHandler;

impl TransformHandler for SortByHandler {
    fn supports(&self, name: &str) -> bool {
        name == directives::SORT_BY
    }

    fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError> {
        let (FieldDirective::SortBy(sort), Value::Array(items)) = (directive, value.clone()) else {
            return Ok(value);
        };

        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let key = match (&sort.comparator, &sort.key) {
                (Some(comparator), _) => {
                    env.evaluate(directives::SORT_BY, comparator, &env.element(&item))?
                }
                (None, Some(key)) => item.get(key).cloned().unwrap_or(Value::Null),
                (None, None) => item.clone(),
            };
            keyed.push((key, item));
        }

        keyed.sort_by(|(a, _), (b, _)| match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if sort.reversed => compare_keys(b, a),
            (false, false) => compare_keys(a, b),
        });

        Ok(Value::Array(keyed.into_iter().map(|(_, item)| item).collect()))
    }
}

/// Orders sort keys; values of different kinds order by kind.
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

/// `@distinct(comparator)`: drops repeats, keeping the first occurrence.
pub struct DistinctHandler;

impl TransformHandler for DistinctHandler {
    fn supports(&self, name: &str) -> bool {
        name == directives::DISTINCT
    }

    fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError> {
        let (FieldDirective::Distinct(distinct), Value::Array(items)) = (directive, value.clone())
        else {
            return Ok(value);
        };

        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let key = match &distinct.comparator {
                Some(comparator) => identity_key(&env.evaluate(
                    directives::DISTINCT,
                    comparator,
                    &env.element(&item),
                )?),
                None => identity_key(&item),
            };
            if seen.insert(key) {
                kept.push(item);
            }
        }
        Ok(Value::Array(kept))
    }
}

/// A hash key shared by values that compare equal: numbers by numeric
/// value, objects regardless of key order.
fn identity_key(value: &Value) -> String {
    let mut key = String::new();
    match value {
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => key.push_str(&int.to_string()),
            #[allow(clippy::cast_possible_truncation)]
            (None, Some(float))
                if float.fract() == 0.0 && float.abs() < 9_007_199_254_740_992.0 =>
            {
                key.push_str(&(float as i64).to_string());
            }
            _ => key.push_str(&number.to_string()),
        },
        other => write_canonical(other, &mut key),
    }
    key
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// `@map(expression)`: replaces the value with a computed one.
pub struct MapHandler;

impl TransformHandler for MapHandler {
    fn supports(&self, name: &str) -> bool {
        name == directives::MAP
    }

    fn is_collection(&self) -> bool {
        false
    }

    fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError> {
        let FieldDirective::Map(map) = directive else {
            return Ok(value);
        };
        env.evaluate(directives::MAP, &map.expression, &env.element(&value))
    }
}

/// Dispatches transform directives to handlers.
pub struct TransformRegistry {
    handlers: Vec<Arc<dyn TransformHandler>>,
    resolved: RwLock<FxHashMap<String, Option<usize>>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TransformRegistry {
    /// Creates a registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            resolved: RwLock::new(FxHashMap::default()),
        }
    }

    /// Creates a registry with the filter, sortBy, distinct and map handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(FilterHandler);
        registry.register(SortByHandler);
        registry.register(DistinctHandler);
        registry.register(MapHandler);
        registry
    }

    /// Registers a handler. Later registrations take precedence.
    pub fn register<H: TransformHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(0, Arc::new(handler));
        if let Ok(mut resolved) = self.resolved.write() {
            resolved.clear();
        }
    }

    /// Finds the handler for a directive name.
    pub fn handler(&self, name: &str) -> Option<Arc<dyn TransformHandler>> {
        let cached = self
            .resolved
            .read()
            .ok()
            .and_then(|resolved| resolved.get(name).copied());

        let index = match cached {
            Some(index) => index,
            None => {
                let index = self.handlers.iter().position(|h| h.supports(name));
                if let Ok(mut resolved) = self.resolved.write() {
                    resolved.insert(name.to_string(), index);
                }
                index
            }
        };
        index.and_then(|i| self.handlers.get(i)).cloned()
    }

    /// Applies one transform directive.
    pub fn apply(
        &self,
        value: Value,
        directive: &FieldDirective,
        env: &TransformEnv<'_>,
    ) -> Result<Value, TransformError> {
        let handler = self
            .handler(directive.name())
            .ok_or_else(|| TransformError::Unsupported(directive.name().to_string()))?;
        if handler.is_collection() && !value.is_array() {
            return Ok(value);
        }
        handler.apply(value, directive, env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::FlattenProjector;
    use calcql_expr::Calculator;
    use calcql_semantic::directives::{
        DistinctDirective, FilterDirective, MapDirective, SortByDirective,
    };
    use serde_json::json;

    fn apply(value: Value, directive: FieldDirective) -> Result<Value, TransformError> {
        let engine = Calculator::new();
        let variables = Environment::new().with("minPrice", json!(10));
        let env = TransformEnv {
            engine: &engine,
            projector: &FlattenProjector,
            variables: &variables,
        };
        TransformRegistry::builtin().apply(value, &directive, &env)
    }

    fn items() -> Value {
        json!([
            {"id": 1, "price": 30, "tag": "b"},
            {"id": 2, "price": null, "tag": "a"},
            {"id": 3, "price": 5, "tag": "b"},
            {"id": 4, "price": 30, "tag": "c"}
        ])
    }

    fn ids(value: &Value) -> Vec<i64> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_filter_uses_fields_and_variables() {
        let predicate = FilterDirective {
            predicate: "price != null && price >= minPrice".to_string(),
        };
        let filtered = apply(items(), FieldDirective::Filter(predicate)).unwrap();
        assert_eq!(ids(&filtered), vec![1, 4]);
    }

    #[test]
    fn test_sort_by_key_nulls_last_and_stable() {
        let sorted = apply(items(), FieldDirective::SortBy(SortByDirective::by_key("price"))).unwrap();
        assert_eq!(ids(&sorted), vec![3, 1, 4, 2]);

        let reversed = apply(
            items(),
            FieldDirective::SortBy(SortByDirective::by_key("price").reversed()),
        )
        .unwrap();
        assert_eq!(ids(&reversed), vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_sort_by_comparator() {
        let sorted = apply(
            items(),
            FieldDirective::SortBy(SortByDirective::by_comparator("tag + string(id)")),
        )
        .unwrap();
        assert_eq!(ids(&sorted), vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_distinct() {
        let plain = apply(json!([3, 1, 3, 2, 1.0]), FieldDirective::Distinct(DistinctDirective::default()));
        assert_eq!(plain.unwrap(), json!([3, 1, 2]));

        let by_tag = apply(
            items(),
            FieldDirective::Distinct(DistinctDirective {
                comparator: Some("tag".to_string()),
            }),
        )
        .unwrap();
        assert_eq!(ids(&by_tag), vec![1, 2, 4]);
    }

    #[test]
    fn test_distinct_identity_ignores_key_order() {
        let value = json!([
            {"a": 1, "b": [1, 2]},
            {"b": [1, 2], "a": 1},
            {"a": 1, "b": [2, 1]},
            2.5,
            2.5
        ]);
        let result = apply(value, FieldDirective::Distinct(DistinctDirective::default())).unwrap();
        assert_eq!(result, json!([{"a": 1, "b": [1, 2]}, {"a": 1, "b": [2, 1]}, 2.5]));
        assert_ne!(identity_key(&json!(1)), identity_key(&json!("1")));
        assert_eq!(identity_key(&json!(4)), identity_key(&json!(4.0)));
    }

    #[test]
    fn test_collection_handlers_skip_non_lists() {
        let value = json!({"id": 1});
        let sorted = apply(value.clone(), FieldDirective::SortBy(SortByDirective::by_key("id")));
        assert_eq!(sorted.unwrap(), value);
    }

    #[test]
    fn test_map_computes_value() {
        let directive = FieldDirective::Map(MapDirective {
            expression: "size(ele) * 10".to_string(),
        });
        assert_eq!(apply(json!([1, 2, 3]), directive).unwrap(), json!(30));

        let directive = FieldDirective::Map(MapDirective {
            expression: "upper(tag)".to_string(),
        });
        assert_eq!(apply(json!({"tag": "x"}), directive).unwrap(), json!("X"));
    }

    #[test]
    fn test_evaluation_errors_are_reported() {
        let directive = FieldDirective::Filter(FilterDirective {
            predicate: "price".to_string(),
        });
        let err = apply(json!([{"price": 1}]), directive).unwrap_err();
        assert!(matches!(err, TransformError::Evaluation { directive: "filter", .. }));
    }

    #[test]
    fn test_handler_lookup_is_cached() {
        let registry = TransformRegistry::builtin();
        assert!(registry.handler("sortBy").is_some());
        assert!(registry.handler("sortBy").is_some());
        assert!(registry.handler("publishSource").is_none());
        assert_eq!(registry.resolved.read().unwrap().len(), 2);
    }
}
