//! Executor configuration.

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Maximum fetches in flight at once.
    pub max_concurrent_fetches: usize,
    /// Maximum task graphs kept for reuse.
    pub graph_cache_capacity: usize,
    /// Flatten list values of sources collected from inside lists.
    pub collect_list_sources_flatten: bool,
    /// Runtime fetches are spawned on. Defaults to the current runtime.
    #[serde(skip)]
    pub runtime: Option<Handle>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 64,
            graph_cache_capacity: 128,
            collect_list_sources_flatten: false,
            runtime: None,
        }
    }
}

impl ExecutorConfig {
    /// Parses a configuration from JSON, filling unset fields with defaults.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    pub fn with_graph_cache_capacity(mut self, capacity: usize) -> Self {
        self.graph_cache_capacity = capacity;
        self
    }

    pub fn with_collect_list_sources_flatten(mut self, flatten: bool) -> Self {
        self.collect_list_sources_flatten = flatten;
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ExecutorConfig::from_json(r#"{"maxConcurrentFetches": 4}"#).unwrap();
        assert_eq!(config.max_concurrent_fetches, 4);
        assert_eq!(config.graph_cache_capacity, 128);
        assert!(!config.collect_list_sources_flatten);
        assert!(config.runtime.is_none());
    }

    #[test]
    fn test_builders() {
        let config = ExecutorConfig::default()
            .with_graph_cache_capacity(2)
            .with_collect_list_sources_flatten(true);
        assert_eq!(config.graph_cache_capacity, 2);
        assert!(config.collect_list_sources_flatten);
    }
}
