//! Resolved query model the executor runs.
//!
//! Queries arrive already parsed and resolved against a schema: every field
//! knows its parent type and return type, and fragments carry their own
//! selections. The model deserializes from JSON so the CLI can load queries
//! from files.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A query operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub selection: Vec<Selection>,
}

impl Operation {
    /// Creates an empty anonymous operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty named operation.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Declares a query variable.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variables.push(VariableDefinition::new(name));
        self
    }

    /// Declares a query variable with a default value.
    #[must_use]
    pub fn variable_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let mut variable = VariableDefinition::new(name);
        variable.default_value = Some(default);
        self.variables.push(variable);
        self
    }

    /// Adds a top-level field.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.selection.push(Selection::Field(field));
        self
    }

    /// Adds a top-level selection.
    #[must_use]
    pub fn select(mut self, selection: Selection) -> Self {
        self.selection.push(selection);
        self
    }

    /// Returns true if `name` is a declared variable.
    pub fn declares_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }

    /// Declared variables with defaults applied over `provided`.
    pub fn resolve_variables(&self, provided: &serde_json::Map<String, Value>) -> IndexMap<String, Value> {
        let mut resolved = IndexMap::with_capacity(self.variables.len());
        for variable in &self.variables {
            let value = provided
                .get(&variable.name)
                .cloned()
                .or_else(|| variable.default_value.clone())
                .unwrap_or(Value::Null);
            resolved.insert(variable.name.clone(), value);
        }
        for (name, value) in provided {
            if !resolved.contains_key(name) {
                resolved.insert(name.clone(), value.clone());
            }
        }
        resolved
    }
}

/// A declared query variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
            default_value: None,
        }
    }
}

/// A selection in a selection set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Selection {
    Field(Field),
    FragmentSpread(FragmentSpread),
    InlineFragment(InlineFragment),
}

impl Selection {
    /// Visits every field reachable from this selection without crossing
    /// into sub-selections of fields. Fragments are flattened.
    pub fn for_each_field<'a>(&'a self, f: &mut impl FnMut(&'a Field)) {
        match self {
            Self::Field(field) => f(field),
            Self::FragmentSpread(spread) => {
                for selection in &spread.selection {
                    selection.for_each_field(f);
                }
            }
            Self::InlineFragment(fragment) => {
                for selection in &fragment.selection {
                    selection.for_each_field(f);
                }
            }
        }
    }
}

/// Flattens a selection set to its fields, in declaration order.
pub fn collect_fields(selection: &[Selection]) -> Vec<&Field> {
    let mut fields = Vec::new();
    for item in selection {
        item.for_each_field(&mut |field| fields.push(field));
    }
    fields
}

/// The occurrences of one response key in a selection set.
#[derive(Debug, Clone)]
pub struct MergedField<'q> {
    /// Every occurrence, in declaration order. Never empty.
    pub copies: Vec<&'q Field>,
    /// Directives of all occurrences. Identical bindings appear once.
    pub directives: Vec<DirectiveBinding>,
    /// Sub-selections of all occurrences, concatenated.
    pub selection: Vec<&'q Selection>,
}

impl<'q> MergedField<'q> {
    fn new(field: &'q Field) -> Self {
        let mut merged = Self {
            copies: Vec::new(),
            directives: Vec::new(),
            selection: Vec::new(),
        };
        merged.add(field);
        merged
    }

    fn add(&mut self, field: &'q Field) {
        self.copies.push(field);
        for binding in &field.directives {
            if !self.directives.contains(binding) {
                self.directives.push(binding.clone());
            }
        }
        self.selection.extend(field.selection.iter());
    }

    /// The first occurrence; its name, arguments and type stand for all.
    pub fn field(&self) -> &'q Field {
        self.copies[0]
    }

    pub fn response_key(&self) -> &'q str {
        self.field().response_key()
    }

    /// The first occurrence that disagrees with the first one on field
    /// name, arguments or return type.
    pub fn conflict(&self) -> Option<&'q Field> {
        let first = self.field();
        self.copies[1..].iter().copied().find(|copy| {
            copy.name != first.name
                || copy.arguments != first.arguments
                || copy.return_type != first.return_type
        })
    }
}

/// Flattens selections to their fields and merges fields sharing a response
/// key, in first-occurrence order.
pub fn merge_fields<'q>(selection: impl IntoIterator<Item = &'q Selection>) -> Vec<MergedField<'q>> {
    let mut merged: IndexMap<&'q str, MergedField<'q>> = IndexMap::new();
    for item in selection {
        item.for_each_field(&mut |field| {
            match merged.get_mut(field.response_key()) {
                Some(existing) => existing.add(field),
                None => {
                    merged.insert(field.response_key(), MergedField::new(field));
                }
            }
        });
    }
    merged.into_values().collect()
}

/// A named fragment spread, already expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpread {
    pub name: String,
    #[serde(default)]
    pub type_condition: Option<String>,
    #[serde(default)]
    pub selection: Vec<Selection>,
}

/// An inline fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFragment {
    #[serde(default)]
    pub type_condition: Option<String>,
    #[serde(default)]
    pub selection: Vec<Selection>,
}

/// A field selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "default_parent_type")]
    pub parent_type: String,
    #[serde(default)]
    pub return_type: TypeRef,
    #[serde(default)]
    pub arguments: Vec<Argument>,
    #[serde(default)]
    pub directives: Vec<DirectiveBinding>,
    #[serde(default)]
    pub selection: Vec<Selection>,
}

fn default_parent_type() -> String {
    "Query".to_string()
}

impl Field {
    /// Creates a field on `parent_type` returning a nullable scalar.
    pub fn new(name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            parent_type: parent_type.into(),
            return_type: TypeRef::default(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection: Vec::new(),
        }
    }

    /// The key this field's value is stored under in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn returns(mut self, ty: TypeRef) -> Self {
        self.return_type = ty;
        self
    }

    #[must_use]
    pub fn argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.push(Argument::new(name, value));
        self
    }

    /// Adds a list-typed argument.
    #[must_use]
    pub fn list_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        let mut argument = Argument::new(name, value);
        argument.list = true;
        self.arguments.push(argument);
        self
    }

    #[must_use]
    pub fn directive(mut self, directive: DirectiveBinding) -> Self {
        self.directives.push(directive);
        self
    }

    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.selection.push(Selection::Field(field));
        self
    }

    #[must_use]
    pub fn select(mut self, selection: Selection) -> Self {
        self.selection.push(selection);
        self
    }

    pub fn get_argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Literal arguments as an ordered map.
    pub fn argument_values(&self) -> IndexMap<String, Value> {
        self.arguments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }
}

/// A reference to a field or variable type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub name: String,
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub non_null: bool,
}

impl Default for TypeRef {
    fn default() -> Self {
        Self::named("String")
    }
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            list: false,
            non_null: false,
        }
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self {
            list: true,
            ..Self::named(name)
        }
    }

    #[must_use]
    pub fn non_null(mut self) -> Self {
        self.non_null = true;
        self
    }
}

/// An argument passed to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    /// Whether the argument is declared with a list type.
    #[serde(default)]
    pub list: bool,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            list: false,
        }
    }

    /// List-typed by declaration or by literal value.
    pub fn is_list(&self) -> bool {
        self.list || self.value.is_array()
    }
}

/// A directive applied to a field, with literal arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectiveBinding {
    pub name: String,
    #[serde(default)]
    pub arguments: IndexMap<String, Value>,
}

impl DirectiveBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_query() {
        let operation: Operation = serde_json::from_value(json!({
            "name": "Profile",
            "variables": [{"name": "limit", "defaultValue": 10}],
            "selection": [{
                "kind": "field",
                "name": "user",
                "returnType": {"name": "User"},
                "selection": [
                    {"kind": "field", "name": "name", "parentType": "User"},
                    {"kind": "inlineFragment", "typeCondition": "User", "selection": [
                        {"kind": "field", "name": "itemIds", "alias": "ids", "parentType": "User",
                         "returnType": {"name": "Int", "list": true},
                         "directives": [{"name": "publishSource", "arguments": {"name": "itemIds"}}]}
                    ]}
                ]
            }]
        }))
        .unwrap();

        let fields = collect_fields(&operation.selection);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].parent_type, "Query");

        let nested = collect_fields(&fields[0].selection);
        let keys: Vec<_> = nested.iter().map(|f| f.response_key()).collect();
        assert_eq!(keys, vec!["name", "ids"]);
        assert!(nested[1].return_type.list);
        assert_eq!(nested[1].directives[0].arguments["name"], json!("itemIds"));
    }

    #[test]
    fn test_merge_fields_by_response_key() {
        let publish = DirectiveBinding::new("publishSource").arg("name", "config");
        let operation = Operation::new()
            .field(Field::new("config", "Query").field(Field::new("limit", "Config")))
            .field(Field::new("config", "Query").alias("other"))
            .select(Selection::InlineFragment(InlineFragment {
                type_condition: None,
                selection: vec![Selection::Field(
                    Field::new("config", "Query")
                        .directive(publish.clone())
                        .field(Field::new("offset", "Config")),
                )],
            }))
            .field(Field::new("config", "Query").directive(publish.clone()));

        let merged = merge_fields(&operation.selection);
        let keys: Vec<_> = merged.iter().map(MergedField::response_key).collect();
        assert_eq!(keys, vec!["config", "other"]);

        let config = &merged[0];
        assert_eq!(config.copies.len(), 3);
        assert_eq!(config.directives, vec![publish]);
        let nested: Vec<_> = merge_fields(config.selection.iter().copied())
            .iter()
            .map(MergedField::response_key)
            .collect();
        assert_eq!(nested, vec!["limit", "offset"]);
        assert!(config.conflict().is_none());
    }

    #[test]
    fn test_merge_fields_reports_conflicts() {
        let operation = Operation::new()
            .field(Field::new("item", "Query").argument("id", json!(1)))
            .field(Field::new("item", "Query").argument("id", json!(2)));
        let merged = merge_fields(&operation.selection);
        assert_eq!(merged.len(), 1);
        let conflict = merged[0].conflict().unwrap();
        assert_eq!(conflict.arguments[0].value, json!(2));
    }

    #[test]
    fn test_resolve_variables_applies_defaults() {
        let operation = Operation::new()
            .variable_with_default("limit", json!(10))
            .variable("after");
        let provided = json!({"after": "abc", "extra": true});
        let resolved = operation.resolve_variables(provided.as_object().unwrap());

        assert_eq!(resolved["limit"], json!(10));
        assert_eq!(resolved["after"], json!("abc"));
        assert_eq!(resolved["extra"], json!(true));
    }

    #[test]
    fn test_argument_list_detection() {
        let field = Field::new("items", "Query")
            .argument("first", json!(3))
            .list_argument("ids", Value::Null)
            .argument("tags", json!(["a"]));
        assert!(!field.get_argument("first").unwrap().is_list());
        assert!(field.get_argument("ids").unwrap().is_list());
        assert!(field.get_argument("tags").unwrap().is_list());
    }
}
