//! Projection of values into expression environments.

use calcql_expr::{Environment, ELEMENT};
use serde_json::Value;

/// Turns a value into the variables an expression sees.
pub trait ValueProjector: Send + Sync {
    fn project(&self, value: &Value) -> Environment;
}

/// Binds every field of an object value by name. Other values bind nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenProjector;

impl ValueProjector for FlattenProjector {
    fn project(&self, value: &Value) -> Environment {
        let mut env = Environment::new();
        env.extend_from_object(value);
        env
    }
}

/// Environment for evaluating against one element: `base`, then the
/// projected element, then the element itself as `ele`.
pub fn element_env(projector: &dyn ValueProjector, base: &Environment, element: &Value) -> Environment {
    let mut env = base.clone();
    env.extend(projector.project(element));
    env.insert(ELEMENT, element.clone());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_projector() {
        let env = FlattenProjector.project(&json!({"id": 1, "price": 9.5}));
        assert_eq!(env.get("id"), Some(&json!(1)));
        assert_eq!(env.get("price"), Some(&json!(9.5)));
        assert!(FlattenProjector.project(&json!([1, 2])).is_empty());
    }

    #[test]
    fn test_element_env_shadows_base() {
        let base = Environment::new().with("id", json!("outer")).with("limit", json!(3));
        let env = element_env(&FlattenProjector, &base, &json!({"id": 2}));
        assert_eq!(env.get("id"), Some(&json!(2)));
        assert_eq!(env.get("limit"), Some(&json!(3)));
        assert_eq!(env.get(ELEMENT), Some(&json!({"id": 2})));
    }
}
