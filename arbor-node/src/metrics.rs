//! Node metrics.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters for the node, registered once at startup.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub spaces_loaded: Counter,
    pub space_load_errors: Counter,
    pub space_cache_evictions: Counter,
    pub hot_sync_rounds: Counter,
}

impl NodeMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let spaces_loaded = Counter::default();
        registry.register(
            "arbor_spaces_loaded",
            "Number of spaces loaded into the cache",
            spaces_loaded.clone(),
        );
        let space_load_errors = Counter::default();
        registry.register(
            "arbor_space_load_errors",
            "Number of space loads that failed",
            space_load_errors.clone(),
        );
        let space_cache_evictions = Counter::default();
        registry.register(
            "arbor_space_cache_evictions",
            "Number of idle objects evicted from caches",
            space_cache_evictions.clone(),
        );
        let hot_sync_rounds = Counter::default();
        registry.register(
            "arbor_hot_sync_rounds",
            "Number of hot sync activation rounds",
            hot_sync_rounds.clone(),
        );
        NodeMetrics {
            spaces_loaded,
            space_load_errors,
            space_cache_evictions,
            hot_sync_rounds,
        }
    }
}
