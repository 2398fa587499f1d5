//! Calculation directives.
//!
//! This module defines the directives calcql understands:
//! - Source wiring (@publishSource, @consumeSource)
//! - Conditional execution (@skipIf, @includeIf)
//! - Value transforms (@filter, @sortBy, @distinct, @map)
//! - Canned values (@mock)
//!
//! Bindings are checked against a [`DirectiveRegistry`] and then decoded into
//! typed [`FieldDirective`]s.

use crate::hir::DirectiveBinding;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PUBLISH_SOURCE: &str = "publishSource";
pub const CONSUME_SOURCE: &str = "consumeSource";
pub const SKIP_IF: &str = "skipIf";
pub const INCLUDE_IF: &str = "includeIf";
pub const FILTER: &str = "filter";
pub const SORT_BY: &str = "sortBy";
pub const DISTINCT: &str = "distinct";
pub const MAP: &str = "map";
pub const MOCK: &str = "mock";

// =============================================================================
// @publishSource / @consumeSource
// =============================================================================

/// Arguments for @publishSource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSource {
    /// Name consumers refer to.
    pub name: String,

    /// Expression applied to the value before it is published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert: Option<String>,
}

impl PublishSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            convert: None,
        }
    }

    pub fn with_convert(mut self, convert: impl Into<String>) -> Self {
        self.convert = Some(convert.into());
        self
    }
}

/// How a consumed source rewrites an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeOperation {
    /// Evaluate once with the whole source value.
    #[default]
    Map,
    /// Evaluate per element of a list source, element bound as `ele`.
    ListMap,
    /// Keep the elements of a list source whose predicate holds.
    Filter,
}

impl ConsumeOperation {
    /// Whether the operation works element by element.
    pub fn is_list(self) -> bool {
        !matches!(self, Self::Map)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Map => "MAP",
            Self::ListMap => "LIST_MAP",
            Self::Filter => "FILTER",
        }
    }
}

/// Arguments for @consumeSource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeSource {
    /// Field argument the result is written to.
    pub argument: String,

    /// Source name to wait for.
    pub name: String,

    #[serde(default)]
    pub operation: ConsumeOperation,

    pub expression: String,
}

impl ConsumeSource {
    pub fn new(
        argument: impl Into<String>,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            argument: argument.into(),
            name: name.into(),
            operation: ConsumeOperation::Map,
            expression: expression.into(),
        }
    }

    pub fn with_operation(mut self, operation: ConsumeOperation) -> Self {
        self.operation = operation;
        self
    }
}

// =============================================================================
// @skipIf / @includeIf
// =============================================================================

/// Arguments for @skipIf and @includeIf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionDirective {
    pub expression: String,
}

// =============================================================================
// Transforms
// =============================================================================

/// Arguments for @filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDirective {
    pub predicate: String,
}

/// Arguments for @sortBy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortByDirective {
    /// Element field to sort by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Expression computing the sort key per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,

    #[serde(default)]
    pub reversed: bool,
}

impl SortByDirective {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn by_comparator(comparator: impl Into<String>) -> Self {
        Self {
            comparator: Some(comparator.into()),
            ..Self::default()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }
}

/// Arguments for @distinct.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DistinctDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
}

/// Arguments for @map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDirective {
    pub expression: String,
}

/// Arguments for @mock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDirective {
    /// Expression producing the field value instead of a fetch.
    pub value: String,
}

// =============================================================================
// Typed directives
// =============================================================================

/// A decoded field directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDirective {
    PublishSource(PublishSource),
    ConsumeSource(ConsumeSource),
    SkipIf(ConditionDirective),
    IncludeIf(ConditionDirective),
    Filter(FilterDirective),
    SortBy(SortByDirective),
    Distinct(DistinctDirective),
    Map(MapDirective),
    Mock(MockDirective),
}

impl FieldDirective {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublishSource(_) => PUBLISH_SOURCE,
            Self::ConsumeSource(_) => CONSUME_SOURCE,
            Self::SkipIf(_) => SKIP_IF,
            Self::IncludeIf(_) => INCLUDE_IF,
            Self::Filter(_) => FILTER,
            Self::SortBy(_) => SORT_BY,
            Self::Distinct(_) => DISTINCT,
            Self::Map(_) => MAP,
            Self::Mock(_) => MOCK,
        }
    }

    /// Whether the directive post-processes the fetched value.
    pub fn is_transform(&self) -> bool {
        matches!(
            self,
            Self::Filter(_) | Self::SortBy(_) | Self::Distinct(_) | Self::Map(_)
        )
    }

    /// Every expression source carried by the directive.
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Self::PublishSource(d) => d.convert.as_deref().into_iter().collect(),
            Self::ConsumeSource(d) => vec![d.expression.as_str()],
            Self::SkipIf(d) | Self::IncludeIf(d) => vec![d.expression.as_str()],
            Self::Filter(d) => vec![d.predicate.as_str()],
            Self::SortBy(d) => d.comparator.as_deref().into_iter().collect(),
            Self::Distinct(d) => d.comparator.as_deref().into_iter().collect(),
            Self::Map(d) => vec![d.expression.as_str()],
            Self::Mock(d) => vec![d.value.as_str()],
        }
    }
}

/// The directives of one field, grouped by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDirectives {
    pub publish: Option<PublishSource>,
    pub consumes: Vec<ConsumeSource>,
    pub skip_if: Option<String>,
    pub include_if: Option<String>,
    pub mock: Option<MockDirective>,
    /// Transforms in declaration order.
    pub transforms: Vec<FieldDirective>,
}

impl FieldDirectives {
    /// Decodes every binding of a field.
    pub fn parse(
        bindings: &[DirectiveBinding],
        registry: &DirectiveRegistry,
    ) -> Result<Self, DirectiveError> {
        let mut directives = Self::default();
        for binding in bindings {
            directives.push(registry.parse(binding)?);
        }
        Ok(directives)
    }

    /// Adds a decoded directive. Later single-use directives replace earlier ones.
    pub fn push(&mut self, directive: FieldDirective) {
        match directive {
            FieldDirective::PublishSource(d) => self.publish = Some(d),
            FieldDirective::ConsumeSource(d) => self.consumes.push(d),
            FieldDirective::SkipIf(d) => self.skip_if = Some(d.expression),
            FieldDirective::IncludeIf(d) => self.include_if = Some(d.expression),
            FieldDirective::Mock(d) => self.mock = Some(d),
            transform => self.transforms.push(transform),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Directive Definitions
// =============================================================================

/// Semantic type of a directive argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    String,
    Int,
    Boolean,
    Enum(&'static [&'static str]),
    StringList,
}

impl ArgumentType {
    /// Whether `value` is acceptable for this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Enum(variants) => value.as_str().is_some_and(|v| variants.contains(&v)),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    pub fn describe(self) -> String {
        match self {
            Self::String => "String".to_string(),
            Self::Int => "Int".to_string(),
            Self::Boolean => "Boolean".to_string(),
            Self::Enum(variants) => variants.join(" | "),
            Self::StringList => "[String]".to_string(),
        }
    }
}

/// A directive argument definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: ArgumentType,
    pub required: bool,
    pub default_value: Option<Value>,
}

impl ArgumentDef {
    fn required(name: &str, ty: ArgumentType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            ty,
            required: true,
            default_value: None,
        }
    }

    fn optional(name: &str, ty: ArgumentType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty, description)
        }
    }

    fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// A directive definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveDefinition {
    pub name: String,
    pub description: Option<String>,
    pub arguments: IndexMap<String, ArgumentDef>,
    pub repeatable: bool,
}

impl DirectiveDefinition {
    fn new(name: &str, description: &str, arguments: Vec<ArgumentDef>) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            arguments: arguments
                .into_iter()
                .map(|arg| (arg.name.clone(), arg))
                .collect(),
            repeatable: false,
        }
    }

    fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    /// Checks a binding's arguments and fills in defaults.
    pub fn coerce(&self, binding: &DirectiveBinding) -> Result<Map<String, Value>, DirectiveError> {
        if let Some(unknown) = binding
            .arguments
            .keys()
            .find(|name| !self.arguments.contains_key(*name))
        {
            return Err(DirectiveError::UnknownArgument {
                directive: self.name.clone(),
                argument: unknown.clone(),
            });
        }

        let mut values = Map::new();
        for (name, def) in &self.arguments {
            match binding.arguments.get(name).filter(|v| !v.is_null()) {
                Some(value) if def.ty.accepts(value) => {
                    values.insert(name.clone(), value.clone());
                }
                Some(value) => {
                    return Err(DirectiveError::InvalidArgument {
                        directive: self.name.clone(),
                        argument: name.clone(),
                        expected: def.ty.describe(),
                        found: value.to_string(),
                    });
                }
                None if def.required => {
                    return Err(DirectiveError::MissingArgument {
                        directive: self.name.clone(),
                        argument: name.clone(),
                    });
                }
                None => {
                    if let Some(default) = &def.default_value {
                        values.insert(name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(values)
    }
}

/// A directive binding that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("unknown directive `@{0}`")]
    UnknownDirective(String),

    #[error("`@{directive}` has no argument `{argument}`")]
    UnknownArgument { directive: String, argument: String },

    #[error("`@{directive}` requires argument `{argument}`")]
    MissingArgument { directive: String, argument: String },

    #[error("`@{directive}({argument}:)` expects {expected}, found {found}")]
    InvalidArgument {
        directive: String,
        argument: String,
        expected: String,
        found: String,
    },
}

/// Registry of the directives a query may use.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    definitions: IndexMap<String, DirectiveDefinition>,
}

impl DirectiveRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every calcql directive.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for definition in create_calculation_directives() {
            registry.register(definition);
        }
        registry
    }

    pub fn register(&mut self, definition: DirectiveDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&DirectiveDefinition> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &DirectiveDefinition> {
        self.definitions.values()
    }

    /// Decodes a binding into a typed directive.
    pub fn parse(&self, binding: &DirectiveBinding) -> Result<FieldDirective, DirectiveError> {
        let definition = self
            .get(&binding.name)
            .ok_or_else(|| DirectiveError::UnknownDirective(binding.name.clone()))?;
        let values = definition.coerce(binding)?;

        Ok(match binding.name.as_str() {
            PUBLISH_SOURCE => FieldDirective::PublishSource(decode(binding, values)?),
            CONSUME_SOURCE => FieldDirective::ConsumeSource(decode(binding, values)?),
            SKIP_IF => FieldDirective::SkipIf(decode(binding, values)?),
            INCLUDE_IF => FieldDirective::IncludeIf(decode(binding, values)?),
            FILTER => FieldDirective::Filter(decode(binding, values)?),
            SORT_BY => FieldDirective::SortBy(decode(binding, values)?),
            DISTINCT => FieldDirective::Distinct(decode(binding, values)?),
            MAP => FieldDirective::Map(decode(binding, values)?),
            MOCK => FieldDirective::Mock(decode(binding, values)?),
            other => return Err(DirectiveError::UnknownDirective(other.to_string())),
        })
    }
}

fn decode<T: DeserializeOwned>(
    binding: &DirectiveBinding,
    values: Map<String, Value>,
) -> Result<T, DirectiveError> {
    serde_json::from_value(Value::Object(values)).map_err(|err| DirectiveError::InvalidArgument {
        directive: binding.name.clone(),
        argument: "*".to_string(),
        expected: "well-formed arguments".to_string(),
        found: err.to_string(),
    })
}

/// Creates every calcql directive definition.
pub fn create_calculation_directives() -> Vec<DirectiveDefinition> {
    use ArgumentType as T;

    vec![
        DirectiveDefinition::new(
            PUBLISH_SOURCE,
            "Publishes the field value under a source name",
            vec![
                ArgumentDef::required("name", T::String, "Source name"),
                ArgumentDef::optional("convert", T::String, "Expression applied before publishing"),
            ],
        ),
        DirectiveDefinition::new(
            CONSUME_SOURCE,
            "Computes an argument from a published source",
            vec![
                ArgumentDef::required("argument", T::String, "Argument to rewrite"),
                ArgumentDef::required("name", T::String, "Source name"),
                ArgumentDef::optional("operation", T::Enum(&["MAP", "LIST_MAP", "FILTER"]), "How the source is applied")
                    .with_default(Value::from("MAP")),
                ArgumentDef::required("expression", T::String, "Expression producing the argument"),
            ],
        )
        .repeatable(),
        DirectiveDefinition::new(
            SKIP_IF,
            "Skips the field when the expression holds",
            vec![ArgumentDef::required("expression", T::String, "Condition over query variables")],
        ),
        DirectiveDefinition::new(
            INCLUDE_IF,
            "Skips the field unless the expression holds",
            vec![ArgumentDef::required("expression", T::String, "Condition over query variables")],
        ),
        DirectiveDefinition::new(
            FILTER,
            "Keeps list elements matching a predicate",
            vec![ArgumentDef::required("predicate", T::String, "Predicate per element")],
        ),
        DirectiveDefinition::new(
            SORT_BY,
            "Sorts list elements",
            vec![
                ArgumentDef::optional("key", T::String, "Element field to sort by"),
                ArgumentDef::optional("comparator", T::String, "Expression computing the sort key"),
                ArgumentDef::optional("reversed", T::Boolean, "Sort descending")
                    .with_default(Value::Bool(false)),
            ],
        ),
        DirectiveDefinition::new(
            DISTINCT,
            "Removes duplicate list elements",
            vec![ArgumentDef::optional("comparator", T::String, "Expression computing identity")],
        ),
        DirectiveDefinition::new(
            MAP,
            "Replaces the value with a computed one",
            vec![ArgumentDef::required("expression", T::String, "Expression over the value")],
        ),
        DirectiveDefinition::new(
            MOCK,
            "Uses a computed value instead of fetching",
            vec![ArgumentDef::required("value", T::String, "Expression producing the value")],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_directives() {
        let registry = DirectiveRegistry::builtin();
        let names: Vec<_> = registry.definitions().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "publishSource",
                "consumeSource",
                "skipIf",
                "includeIf",
                "filter",
                "sortBy",
                "distinct",
                "map",
                "mock"
            ]
        );
        assert!(registry.get(CONSUME_SOURCE).unwrap().repeatable);
        assert!(!registry.get(SORT_BY).unwrap().repeatable);
    }

    #[test]
    fn test_consume_source_defaults() {
        let registry = DirectiveRegistry::builtin();
        let binding = DirectiveBinding::new(CONSUME_SOURCE)
            .arg("argument", "ids")
            .arg("name", "itemIds")
            .arg("expression", "itemIds");

        let FieldDirective::ConsumeSource(consume) = registry.parse(&binding).unwrap() else {
            panic!("expected consumeSource");
        };
        assert_eq!(consume, ConsumeSource::new("ids", "itemIds", "itemIds"));
    }

    #[test]
    fn test_list_map_operation() {
        let registry = DirectiveRegistry::builtin();
        let binding = DirectiveBinding::new(CONSUME_SOURCE)
            .arg("argument", "ids")
            .arg("name", "items")
            .arg("operation", "LIST_MAP")
            .arg("expression", "ele.id");

        let FieldDirective::ConsumeSource(consume) = registry.parse(&binding).unwrap() else {
            panic!("expected consumeSource");
        };
        assert_eq!(consume.operation, ConsumeOperation::ListMap);
        assert!(consume.operation.is_list());
    }

    #[test]
    fn test_sort_by_defaults() {
        let registry = DirectiveRegistry::builtin();
        let directive = registry
            .parse(&DirectiveBinding::new(SORT_BY).arg("key", "price"))
            .unwrap();
        assert_eq!(directive, FieldDirective::SortBy(SortByDirective::by_key("price")));
        assert!(directive.is_transform());
    }

    #[test]
    fn test_argument_errors() {
        let registry = DirectiveRegistry::builtin();

        assert_eq!(
            registry.parse(&DirectiveBinding::new("cache")),
            Err(DirectiveError::UnknownDirective("cache".to_string()))
        );
        assert!(matches!(
            registry.parse(&DirectiveBinding::new(PUBLISH_SOURCE)),
            Err(DirectiveError::MissingArgument { .. })
        ));
        assert!(matches!(
            registry.parse(&DirectiveBinding::new(PUBLISH_SOURCE).arg("name", 3)),
            Err(DirectiveError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.parse(&DirectiveBinding::new(FILTER).arg("predicate", "true").arg("limit", 1)),
            Err(DirectiveError::UnknownArgument { .. })
        ));
        assert!(matches!(
            registry.parse(
                &DirectiveBinding::new(CONSUME_SOURCE)
                    .arg("argument", "a")
                    .arg("name", "s")
                    .arg("operation", "REDUCE")
                    .arg("expression", "s")
            ),
            Err(DirectiveError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_field_directives_grouping() {
        let registry = DirectiveRegistry::builtin();
        let bindings = vec![
            DirectiveBinding::new(PUBLISH_SOURCE).arg("name", "items"),
            DirectiveBinding::new(FILTER).arg("predicate", "ele.price > 10"),
            DirectiveBinding::new(SKIP_IF).arg("expression", "hide"),
            DirectiveBinding::new(SORT_BY).arg("key", "price").arg("reversed", json!(true)),
        ];
        let directives = FieldDirectives::parse(&bindings, &registry).unwrap();

        assert_eq!(directives.publish, Some(PublishSource::new("items")));
        assert_eq!(directives.skip_if.as_deref(), Some("hide"));
        let names: Vec<_> = directives.transforms.iter().map(FieldDirective::name).collect();
        assert_eq!(names, vec!["filter", "sortBy"]);
    }
}
