//! Aggregated statistics across every engine component.

use serde::{Deserialize, Serialize};

use mnemo_cache::CacheStats;
use mnemo_consolidation::ConsolidationStats;
use mnemo_core::config::SearchStrategy;
use mnemo_store::StoreStats;
use mnemo_vector::IndexStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub index: IndexStats,
    /// Internal query-result cache.
    pub query_cache: CacheStats,
    /// General-purpose cache exposed through `MemoryEngine::cache`.
    pub cache: CacheStats,
    pub consolidation: ConsolidationStats,
    pub search_strategy: SearchStrategy,
    pub plugins: Vec<String>,
    /// Whether the node count has reached the consolidation threshold.
    pub consolidation_due: bool,
}

impl EngineStats {
    /// One-line human summary, used by the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} nodes ({} active, {} embedded), {} edges, {} vectors, {} consolidation passes, query cache hit rate {:.1}%",
            self.store.nodes,
            self.store.active_nodes,
            self.store.embedded_nodes,
            self.store.edges,
            self.index.vectors,
            self.consolidation.passes,
            self.query_cache.hit_rate() * 100.0,
        )
    }
}
