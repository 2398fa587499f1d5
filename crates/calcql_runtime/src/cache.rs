//! Reuse of task graphs across executions of the same query shape.

use crate::graph::TaskGraph;
use calcql_semantic::hir::Operation;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Encoded shape of an operation. Variable values are not part of it.
///
/// Lookups hash the encoding and then compare it in full, so two distinct
/// shapes never share an entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey(Box<[u8]>);

impl ShapeKey {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShapeKey({} bytes)", self.0.len())
    }
}

/// Returns the cache key of an operation, or `None` when it cannot be
/// encoded and so must not be cached.
pub fn shape_key(operation: &Operation) -> Option<ShapeKey> {
    serde_json::to_vec(operation)
        .ok()
        .map(|encoded| ShapeKey(encoded.into_boxed_slice()))
}

/// Bounded FIFO cache of built graphs.
#[derive(Debug)]
pub struct GraphCache {
    capacity: usize,
    graphs: Mutex<IndexMap<ShapeKey, Arc<TaskGraph>, FxBuildHasher>>,
}

impl GraphCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            graphs: Mutex::new(IndexMap::default()),
        }
    }

    pub fn get(&self, key: &ShapeKey) -> Option<Arc<TaskGraph>> {
        self.graphs.lock().ok()?.get(key).cloned()
    }

    /// Stores a graph, evicting the oldest entry when full.
    pub fn insert(&self, key: ShapeKey, graph: Arc<TaskGraph>) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut graphs) = self.graphs.lock() else {
            return;
        };
        while graphs.len() >= self.capacity && !graphs.contains_key(&key) {
            graphs.shift_remove_index(0);
        }
        graphs.insert(key, graph);
    }

    pub fn len(&self) -> usize {
        self.graphs.lock().map_or(0, |graphs| graphs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut graphs) = self.graphs.lock() {
            graphs.clear();
        }
    }
}
