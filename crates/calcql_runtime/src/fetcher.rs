//! Fetcher system for calcql.
//!
//! Fetchers produce field values. The executor never inspects how: a fetch is
//! an opaque future that runs on the worker runtime.

use crate::error::FetchError;
use calcql_semantic::TypeRef;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Arguments passed to a fetcher, after source rewriting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchArgs {
    args: IndexMap<String, Value>,
}

impl FetchArgs {
    /// Creates empty fetch args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, FetchError> {
        self.args
            .get(name)
            .ok_or_else(|| FetchError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| FetchError::ArgumentParse(name.to_string(), e.to_string()))
            })
    }

    /// Returns all arguments in declaration order.
    pub fn all(&self) -> &IndexMap<String, Value> {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

impl From<IndexMap<String, Value>> for FetchArgs {
    fn from(args: IndexMap<String, Value>) -> Self {
        Self { args }
    }
}

/// Everything a fetcher knows about the field occurrence it serves.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// `#`-joined query path.
    pub path: String,
    pub field_name: String,
    pub parent_type: String,
    pub return_type: TypeRef,
    /// Value of the enclosing object.
    pub parent: Value,
    pub arguments: FetchArgs,
}

impl FetchRequest {
    /// Creates a request with no parent value and no arguments.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            path: field_name.clone(),
            field_name,
            parent_type: parent_type.into(),
            return_type: TypeRef::default(),
            parent: Value::Null,
            arguments: FetchArgs::new(),
        }
    }

    pub fn with_parent(mut self, parent: Value) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_arguments(mut self, arguments: FetchArgs) -> Self {
        self.arguments = arguments;
        self
    }

    /// The registry key, `Type.field`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.parent_type, self.field_name)
    }
}

/// Result type for fetchers.
pub type FetchResult = Result<Value, FetchError>;

/// Future type for fetches. Fetches run detached on the worker runtime.
pub type FetchFuture = Pin<Box<dyn Future<Output = FetchResult> + Send + 'static>>;

/// Trait for field fetchers.
pub trait Fetcher: Send + Sync {
    /// Fetches a field value.
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

/// A sync fetch function.
pub type SyncFetchFn = Arc<dyn Fn(&FetchRequest) -> FetchResult + Send + Sync>;

/// A wrapper for sync fetch functions.
pub struct FnFetcher {
    func: SyncFetchFn,
}

impl FnFetcher {
    /// Creates a new function fetcher.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&FetchRequest) -> FetchResult + Send + Sync + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Fetcher for FnFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let result = (self.func)(&request);
        Box::pin(async move { result })
    }
}

/// An async fetch function type.
pub type AsyncFetchFn = Arc<dyn Fn(FetchRequest) -> FetchFuture + Send + Sync>;

/// A wrapper for async fetch functions.
pub struct AsyncFnFetcher {
    func: AsyncFetchFn,
}

impl AsyncFnFetcher {
    /// Creates a new async function fetcher.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |request| Box::pin(f(request))),
        }
    }
}

impl Fetcher for AsyncFnFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        (self.func)(request)
    }
}

/// Default fetcher that reads the field from the parent object.
pub struct PropertyFetcher;

impl Fetcher for PropertyFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let field_name = &request.field_name;
        let result = match &request.parent {
            Value::Object(map) => Ok(map
                .get(field_name)
                .or_else(|| map.get(&to_snake_case(field_name)))
                .cloned()
                .unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            _ => Err(FetchError::FieldNotFound(field_name.clone())),
        };
        Box::pin(async move { result })
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Storage for fetchers organized by type and field.
pub struct FetcherMap {
    /// Fetchers indexed by "TypeName.fieldName".
    fetchers: FxHashMap<String, Arc<dyn Fetcher>>,

    /// Fetcher for unregistered fields.
    default_fetcher: Option<Arc<dyn Fetcher>>,
}

impl Default for FetcherMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FetcherMap {
    /// Creates a fetcher map that falls back to property access.
    pub fn new() -> Self {
        Self {
            fetchers: FxHashMap::default(),
            default_fetcher: Some(Arc::new(PropertyFetcher)),
        }
    }

    /// Registers a fetcher for a specific type and field.
    pub fn register<F: Fetcher + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        fetcher: F,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.fetchers.insert(key, Arc::new(fetcher));
    }

    /// Registers a sync function as a fetcher.
    pub fn register_fn<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&FetchRequest) -> FetchResult + Send + Sync + 'static,
    {
        self.register(type_name, field_name, FnFetcher::new(f));
    }

    /// Registers an async function as a fetcher.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnFetcher::new(f));
    }

    /// Gets the fetcher for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<Arc<dyn Fetcher>> {
        let key = format!("{type_name}.{field_name}");
        self.fetchers
            .get(&key)
            .or(self.default_fetcher.as_ref())
            .cloned()
    }

    /// Sets the default fetcher.
    pub fn set_default<F: Fetcher + 'static>(&mut self, fetcher: F) {
        self.default_fetcher = Some(Arc::new(fetcher));
    }

    /// Removes the default fetcher.
    pub fn remove_default(&mut self) {
        self.default_fetcher = None;
    }

    /// Runs the fetcher registered for the request's field.
    pub fn fetch(&self, request: FetchRequest) -> FetchFuture {
        match self.get(&request.parent_type, &request.field_name) {
            Some(fetcher) => fetcher.fetch(request),
            None => {
                let result: FetchResult = Err(FetchError::NoFetcher(request.key()));
                Box::pin(async move { result })
            }
        }
    }
}

impl Debug for FetcherMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherMap")
            .field("fetcher_count", &self.fetchers.len())
            .field("has_default", &self.default_fetcher.is_some())
            .finish()
    }
}
