//! Tree-walking evaluator over JSON values.

use crate::ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
use crate::env::Environment;
use crate::error::EvalError;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Evaluates `expr` against `env`.
pub fn evaluate(expr: &Expr, env: &Environment) -> Result<Value, EvalError> {
    match &expr.kind {
        ExprKind::Literal(literal) => literal_value(literal),
        ExprKind::Variable(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
        ExprKind::List(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ExprKind::Member { object, property } => match evaluate(object, env)? {
            Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(mismatch(".", "object", &other)),
        },
        ExprKind::Index { object, index } => {
            let object = evaluate(object, env)?;
            let index = evaluate(index, env)?;
            index_value(&object, &index)
        }
        ExprKind::Unary { op, operand } => {
            let value = evaluate(operand, env)?;
            unary(*op, &value)
        }
        ExprKind::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                if !as_bool("&&", &evaluate(lhs, env)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool("&&", &evaluate(rhs, env)?)?))
            }
            BinaryOp::Or => {
                if as_bool("||", &evaluate(lhs, env)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool("||", &evaluate(rhs, env)?)?))
            }
            _ => {
                let lhs = evaluate(lhs, env)?;
                let rhs = evaluate(rhs, env)?;
                binary(*op, &lhs, &rhs)
            }
        },
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => {
            if as_bool("?:", &evaluate(condition, env)?)? {
                evaluate(then, env)
            } else {
                evaluate(otherwise, env)
            }
        }
        ExprKind::Call { function, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(function, &args)
        }
    }
}

/// Returns the JSON type name of a value, used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Total order used by sorting: numbers, then strings, then booleans.
///
/// Returns `None` for values that are not mutually comparable.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (Num::of(a), Num::of(b)) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality that treats `1` and `1.0` as equal.
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => compare_values(lhs, rhs) == Some(Ordering::Equal),
        _ => lhs == rhs,
    }
}

fn literal_value(literal: &Literal) -> Result<Value, EvalError> {
    Ok(match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::from(*i),
        Literal::Float(f) => float_value("literal", *f)?,
        Literal::String(s) => Value::String(s.clone()),
    })
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(number: &Number) -> Self {
        match number.as_i64() {
            Some(i) => Self::Int(i),
            None => Self::Float(number.as_f64().unwrap_or(f64::NAN)),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

/// 2^63: floats in `-I64_LIMIT..I64_LIMIT` truncate to an `i64` exactly.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// JSON has no infinities or NaN.
fn float_value(op: &str, f: f64) -> Result<Value, EvalError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Overflow(op.to_string()))
}

fn mismatch(op: &str, expected: &'static str, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op: op.to_string(),
        expected,
        found: type_name(found),
    }
}

fn as_bool(op: &str, value: &Value) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| mismatch(op, "boolean", value))
}

fn as_num(op: &str, value: &Value) -> Result<Num, EvalError> {
    match value {
        Value::Number(n) => Ok(Num::of(n)),
        other => Err(mismatch(op, "number", other)),
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!as_bool("!", value)?)),
        UnaryOp::Neg => match as_num("-", value)? {
            Num::Int(i) => i
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| EvalError::Overflow("-".to_string())),
            Num::Float(f) => float_value("-", -f),
        },
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => add(lhs, rhs),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, lhs, rhs),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = compare_values(lhs, rhs).ok_or_else(|| EvalError::TypeMismatch {
                op: op.to_string(),
                expected: type_name(lhs),
                found: type_name(rhs),
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::And | BinaryOp::Or => {
            let lhs = as_bool(op.as_str(), lhs)?;
            let rhs = as_bool(op.as_str(), rhs)?;
            Ok(Value::Bool(if op == BinaryOp::And {
                lhs && rhs
            } else {
                lhs || rhs
            }))
        }
    }
}

fn add(lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::String(a), b) => Ok(Value::String(format!("{a}{}", display(b)))),
        (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", display(a)))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => arithmetic(BinaryOp::Add, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let symbol = op.as_str();
    let (a, b) = (as_num(symbol, lhs)?, as_num(symbol, rhs)?);

    if let (Num::Int(a), Num::Int(b)) = (a, b) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| EvalError::Overflow(symbol.to_string()));
    }

    let (a, b) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    float_value(symbol, result)
}

fn index_value(object: &Value, index: &Value) -> Result<Value, EvalError> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) => {
            let Num::Int(i) = Num::of(n) else {
                return Err(mismatch("[]", "integer", index));
            };
            usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or(EvalError::IndexOutOfBounds {
                    index: i,
                    len: items.len(),
                })
        }
        (Value::Array(_), other) => Err(mismatch("[]", "integer", other)),
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(_), other) => Err(mismatch("[]", "string", other)),
        (Value::Null, _) => Ok(Value::Null),
        (other, _) => Err(mismatch("[]", "list or object", other)),
    }
}

/// Renders a value for string concatenation: strings without quotes.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn arity(function: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(EvalError::Arity {
            function: function.to_string(),
            expected,
            found: args.len(),
        })
    }
}

fn call(function: &str, args: &[Value]) -> Result<Value, EvalError> {
    match function {
        "size" => {
            arity(function, args, 1)?;
            let len = match &args[0] {
                Value::Array(items) => items.len(),
                Value::String(s) => s.chars().count(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(mismatch("size", "list, string or object", other)),
            };
            Ok(Value::from(len))
        }
        "contains" => {
            arity(function, args, 2)?;
            match (&args[0], &args[1]) {
                (Value::Array(items), needle) => {
                    Ok(Value::Bool(items.iter().any(|item| values_equal(item, needle))))
                }
                (Value::String(s), Value::String(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
                (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
                (other, _) => Err(mismatch("contains", "list, string or object", other)),
            }
        }
        "isNull" => {
            arity(function, args, 1)?;
            Ok(Value::Bool(args[0].is_null()))
        }
        "abs" => {
            arity(function, args, 1)?;
            match as_num("abs", &args[0])? {
                Num::Int(i) => i
                    .checked_abs()
                    .map(Value::from)
                    .ok_or_else(|| EvalError::Overflow("abs".to_string())),
                Num::Float(f) => float_value("abs", f.abs()),
            }
        }
        "min" | "max" => {
            let Some((first, rest)) = args.split_first() else {
                return Err(EvalError::Arity {
                    function: function.to_string(),
                    expected: 1,
                    found: 0,
                });
            };
            let wanted = if function == "min" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best = first;
            for candidate in rest {
                let ordering = compare_values(candidate, best).ok_or_else(|| {
                    EvalError::TypeMismatch {
                        op: function.to_string(),
                        expected: type_name(best),
                        found: type_name(candidate),
                    }
                })?;
                if ordering == wanted {
                    best = candidate;
                }
            }
            Ok(best.clone())
        }
        "string" => {
            arity(function, args, 1)?;
            Ok(Value::String(display(&args[0])))
        }
        "int" => {
            arity(function, args, 1)?;
            match &args[0] {
                Value::Number(n) => match Num::of(n) {
                    Num::Int(i) => Ok(Value::from(i)),
                    #[allow(clippy::cast_possible_truncation)]
                    Num::Float(f) if (-I64_LIMIT..I64_LIMIT).contains(&f.trunc()) => {
                        Ok(Value::from(f.trunc() as i64))
                    }
                    Num::Float(_) => Err(EvalError::Overflow("int".to_string())),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| mismatch("int", "numeric string", &args[0])),
                Value::Bool(b) => Ok(Value::from(i64::from(*b))),
                other => Err(mismatch("int", "number or string", other)),
            }
        }
        "lower" | "upper" => {
            arity(function, args, 1)?;
            match &args[0] {
                Value::String(s) if function == "lower" => Ok(Value::String(s.to_lowercase())),
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Err(mismatch(function, "string", other)),
            }
        }
        "keys" => {
            arity(function, args, 1)?;
            match &args[0] {
                Value::Object(map) => Ok(Value::Array(
                    map.keys().cloned().map(Value::String).collect(),
                )),
                other => Err(mismatch("keys", "object", other)),
            }
        }
        "object" => {
            // object("k1", v1, "k2", v2, ...)
            if args.len() % 2 != 0 {
                return Err(EvalError::Arity {
                    function: function.to_string(),
                    expected: args.len() + 1,
                    found: args.len(),
                });
            }
            let mut map = Map::new();
            for pair in args.chunks(2) {
                let Value::String(key) = &pair[0] else {
                    return Err(mismatch("object", "string", &pair[0]));
                };
                map.insert(key.clone(), pair[1].clone());
            }
            Ok(Value::Object(map))
        }
        _ => Err(EvalError::UnknownFunction(function.to_string())),
    }
}

/// Names of the built-in functions.
pub const FUNCTIONS: &[&str] = &[
    "size", "contains", "isNull", "abs", "min", "max", "string", "int", "lower", "upper", "keys",
    "object",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn eval(source: &str, env: &Environment) -> Result<Value, EvalError> {
        evaluate(&parse(source).unwrap(), env)
    }

    fn env() -> Environment {
        Environment::new()
            .with("itemIds", json!([1, 2, 3]))
            .with("user", json!({"name": "Alice", "age": 30}))
            .with("ratio", json!(0.5))
    }

    #[test]
    fn test_arithmetic() {
        let env = env();
        assert_eq!(eval("1 + 2 * 3", &env).unwrap(), json!(7));
        assert_eq!(eval("7 / 2", &env).unwrap(), json!(3));
        assert_eq!(eval("7 % 4", &env).unwrap(), json!(3));
        assert_eq!(eval("ratio * 4", &env).unwrap(), json!(2.0));
        assert_eq!(eval("-user.age + 1", &env).unwrap(), json!(-29));
    }

    #[test]
    fn test_strings_and_lists() {
        let env = env();
        assert_eq!(
            eval("'hi ' + user.name + 1", &env).unwrap(),
            json!("hi Alice1")
        );
        assert_eq!(eval("itemIds + [4]", &env).unwrap(), json!([1, 2, 3, 4]));
        assert_eq!(eval("itemIds[1]", &env).unwrap(), json!(2));
        assert_eq!(eval("user['name']", &env).unwrap(), json!("Alice"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let env = env();
        assert_eq!(eval("user.age >= 30 && size(itemIds) == 3", &env).unwrap(), json!(true));
        assert_eq!(eval("1 == 1.0", &env).unwrap(), json!(true));
        assert_eq!(eval("false && missing", &env).unwrap(), json!(false));
        assert_eq!(eval("user.age > 40 ? 'old' : 'young'", &env).unwrap(), json!("young"));
    }

    #[test]
    fn test_functions() {
        let env = env();
        assert_eq!(eval("contains(itemIds, 2)", &env).unwrap(), json!(true));
        assert_eq!(eval("max(3, 9, 4)", &env).unwrap(), json!(9));
        assert_eq!(eval("int('42') + abs(-1)", &env).unwrap(), json!(43));
        assert_eq!(eval("upper(user.name)", &env).unwrap(), json!("ALICE"));
        assert_eq!(eval("isNull(user.missing)", &env).unwrap(), json!(true));
        assert_eq!(
            eval("object('id', itemIds[0])", &env).unwrap(),
            json!({"id": 1})
        );
    }

    #[test]
    fn test_typed_errors() {
        let env = env();
        assert_eq!(
            eval("nope + 1", &env),
            Err(EvalError::UndefinedVariable("nope".to_string()))
        );
        assert_eq!(eval("1 / 0", &env), Err(EvalError::DivisionByZero));
        assert_eq!(eval("ratio / 0", &env), Err(EvalError::DivisionByZero));
        assert!(matches!(
            eval("user.name - 1", &env),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert_eq!(
            eval("itemIds[5]", &env),
            Err(EvalError::IndexOutOfBounds { index: 5, len: 3 })
        );
        assert_eq!(
            eval("shout(1)", &env),
            Err(EvalError::UnknownFunction("shout".to_string()))
        );
        assert!(matches!(eval("size()", &env), Err(EvalError::Arity { .. })));
        assert!(matches!(
            eval("9223372036854775807 + 1", &env),
            Err(EvalError::Overflow(_))
        ));
    }

    #[test]
    fn test_float_overflow_is_an_error() {
        let env = env();
        assert_eq!(
            eval("1.0e308 * 10.0", &env),
            Err(EvalError::Overflow("*".to_string()))
        );
        assert_eq!(
            eval("int(1.0e19)", &env),
            Err(EvalError::Overflow("int".to_string()))
        );
        assert_eq!(eval("int(-2.9)", &env), Ok(json!(-2)));
    }

    #[test]
    fn test_error_messages() {
        let err = eval("user.name - 1", &env()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"type mismatch in `-`: expected number, found string");
    }

    #[test]
    fn test_compare_values_orders_mixed_numbers() {
        assert_eq!(compare_values(&json!(1), &json!(1.5)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }
}
