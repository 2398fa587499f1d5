//! The pluggable expression engine seam and its default implementation.

use crate::ast::Expr;
use crate::env::Environment;
use crate::error::{CompileError, EvalError};
use crate::eval::{self, FUNCTIONS};
use crate::parser::parse;
use calcql_core::Span;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use serde_json::Value;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, RwLock};

/// Outcome of validating an expression source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub message: Option<String>,
    /// Where in the source the expression stopped compiling.
    pub span: Option<Span>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            ok: true,
            message: None,
            span: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            span: None,
        }
    }

    #[must_use]
    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// An expression language the runtime can validate and evaluate.
///
/// Implementations must be shareable across fetch tasks.
pub trait ExpressionEngine: Send + Sync {
    /// Checks that `source` compiles.
    fn validate(&self, source: &str) -> ValidationResult;

    /// Names of the variables `source` reads.
    fn free_variables(&self, source: &str) -> Result<BTreeSet<String>, CompileError>;

    /// Evaluates `source` against `env`.
    fn evaluate(&self, source: &str, env: &Environment) -> Result<Value, EvalError>;

    /// Evaluates `source` and requires a boolean result.
    fn evaluate_predicate(&self, source: &str, env: &Environment) -> Result<bool, EvalError> {
        match self.evaluate(source, env)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::TypeMismatch {
                op: "predicate".to_string(),
                expected: "boolean",
                found: eval::type_name(&other),
            }),
        }
    }
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    expr: Expr,
}

impl Program {
    /// Compiles `source`, rejecting calls to unknown functions.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let expr = parse(source)?;
        check_functions(&expr, source)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn free_variables(&self) -> BTreeSet<String> {
        self.expr.free_variables()
    }

    pub fn evaluate(&self, env: &Environment) -> Result<Value, EvalError> {
        eval::evaluate(&self.expr, env)
    }
}

fn check_functions(expr: &Expr, source: &str) -> Result<(), CompileError> {
    use crate::ast::ExprKind;

    match &expr.kind {
        ExprKind::Call { function, args } => {
            if !FUNCTIONS.contains(&function.as_str()) {
                return Err(CompileError::new(
                    format!("unknown function `{function}`"),
                    source,
                    expr.span,
                ));
            }
            args.iter().try_for_each(|arg| check_functions(arg, source))
        }
        ExprKind::Literal(_) | ExprKind::Variable(_) => Ok(()),
        ExprKind::List(items) => items.iter().try_for_each(|item| check_functions(item, source)),
        ExprKind::Member { object, .. } => check_functions(object, source),
        ExprKind::Index { object, index } => {
            check_functions(object, source)?;
            check_functions(index, source)
        }
        ExprKind::Unary { operand, .. } => check_functions(operand, source),
        ExprKind::Binary { lhs, rhs, .. } => {
            check_functions(lhs, source)?;
            check_functions(rhs, source)
        }
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => {
            check_functions(condition, source)?;
            check_functions(then, source)?;
            check_functions(otherwise, source)
        }
    }
}

/// Programs a [`Calculator`] keeps by default.
pub const DEFAULT_PROGRAM_CACHE_CAPACITY: usize = 1024;

type ProgramCache = IndexMap<String, Arc<Program>, BuildHasherDefault<FxHasher>>;

/// The default engine. Compiled programs are cached by source text, oldest
/// evicted first.
#[derive(Debug)]
pub struct Calculator {
    capacity: usize,
    cache: RwLock<ProgramCache>,
}

impl Default for Calculator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PROGRAM_CACHE_CAPACITY)
    }
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a calculator caching at most `capacity` programs. Zero
    /// disables caching.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            cache: RwLock::new(ProgramCache::default()),
        }
    }

    /// Returns the compiled program for `source`, compiling on first use.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>, CompileError> {
        if let Some(program) = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(source).cloned())
        {
            return Ok(program);
        }

        let program = Arc::new(Program::compile(source)?);
        if self.capacity == 0 {
            return Ok(program);
        }
        if let Ok(mut cache) = self.cache.write() {
            if !cache.contains_key(source) {
                while cache.len() >= self.capacity {
                    cache.shift_remove_index(0);
                }
                cache.insert(source.to_string(), Arc::clone(&program));
            }
        }
        Ok(program)
    }

    /// Number of cached programs.
    pub fn cached(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }
}

impl ExpressionEngine for Calculator {
    fn validate(&self, source: &str) -> ValidationResult {
        match self.compile(source) {
            Ok(_) => ValidationResult::valid(),
            Err(err) => {
                let span = err.span();
                ValidationResult::invalid(err.message).at(span)
            }
        }
    }

    fn free_variables(&self, source: &str) -> Result<BTreeSet<String>, CompileError> {
        Ok(self.compile(source)?.free_variables())
    }

    fn evaluate(&self, source: &str, env: &Environment) -> Result<Value, EvalError> {
        self.compile(source)?.evaluate(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate() {
        let calc = Calculator::new();
        assert!(calc.validate("a + 1").ok);

        let result = calc.validate("a +");
        assert!(!result.ok);
        assert!(result.message.is_some());

        let result = calc.validate("explode(a)");
        assert_eq!(result.message.as_deref(), Some("unknown function `explode`"));
        assert!(result.span.is_some());
    }

    #[test]
    fn test_programs_are_cached() {
        let calc = Calculator::new();
        let env = Environment::new().with("ele", json!({"id": 7}));
        assert_eq!(calc.evaluate("ele.id * 2", &env).unwrap(), json!(14));
        assert_eq!(calc.evaluate("ele.id * 2", &env).unwrap(), json!(14));
        assert_eq!(calc.cached(), 1);
    }

    #[test]
    fn test_program_cache_is_bounded() {
        let calc = Calculator::with_capacity(2);
        let env = Environment::new().with("n", json!(1));
        for source in ["n + 1", "n + 2", "n + 3"] {
            calc.evaluate(source, &env).unwrap();
        }
        assert_eq!(calc.cached(), 2);
        assert_eq!(calc.evaluate("n + 1", &env).unwrap(), json!(2));
        assert_eq!(calc.cached(), 2);

        let uncached = Calculator::with_capacity(0);
        uncached.evaluate("n * 2", &env).unwrap();
        assert_eq!(uncached.cached(), 0);
    }

    #[test]
    fn test_predicate_requires_boolean() {
        let calc = Calculator::new();
        let env = Environment::new().with("x", json!(3));
        assert!(calc.evaluate_predicate("x > 2", &env).unwrap());
        assert!(matches!(
            calc.evaluate_predicate("x + 1", &env),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_free_variables() {
        let calc = Calculator::new();
        let names = calc.free_variables("ele.price * rate + bonus").unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["bonus", "ele", "rate"]);
    }
}
