//! The memory engine façade.
//!
//! Writes flow store → index → query-cache invalidation. Reads go through
//! the query cache, then the index, then the store to resolve nodes.
//!
//! A coarse `RwLock<()>` gate orders the store and index relative to each
//! other: queries hold it shared, writes and consolidation hold it
//! exclusively. The caches keep their own locks and are never held across
//! a gate acquisition.

use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mnemo_cache::{CacheOptions, TieredCache};
use mnemo_consolidation::{ConsolidationEngine, DecayReport};
use mnemo_core::config::MnemoConfig;
use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{ConsolidationReport, Content, Edge, Metadata, Node, SearchMode};
use mnemo_store::{EntityStore, Snapshot};
use mnemo_vector::{
    CancelToken, EmbeddingService, IndexHit, IvfParams, VectorIndex, VectorIndexOptions,
};

use crate::plugin::{MemoryPlugin, PluginRegistry};
use crate::stats::EngineStats;

/// A resolved query hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub node: Node,
    pub distance: f32,
}

/// Result of a cancellable query.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// False when the scan was cut short by the cancel token.
    pub complete: bool,
    /// The mode that answered the query.
    pub mode: SearchMode,
}

pub struct MemoryEngine {
    config: MnemoConfig,
    store: EntityStore,
    index: VectorIndex,
    consolidation: ConsolidationEngine,
    /// `None` when `query_cache_entries` is zero.
    query_cache: Option<TieredCache<Vec<IndexHit>>>,
    cache: TieredCache<serde_json::Value>,
    plugins: RwLock<PluginRegistry>,
    gate: RwLock<()>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("nodes", &self.store.len())
            .field("vectors", &self.index.len())
            .field("dimension", &self.store.dimension())
            .finish()
    }
}

impl MemoryEngine {
    /// Build an engine from a validated configuration.
    pub fn new(config: MnemoConfig) -> Result<Self> {
        config.validate()?;

        let vector = &config.vector;
        let mut options = VectorIndexOptions::new(vector.dimension)
            .with_metric(vector.metric)
            .with_ivf(IvfParams {
                partitions: vector.ivf_partitions,
                probes: vector.ivf_probes,
                iterations: vector.kmeans_iterations,
                min_training_size: vector.min_training_size,
            });
        if let Some(max) = vector.max_vectors {
            options = options.with_max_vectors(max);
        }

        let query_cache = (config.cache.query_cache_entries > 0).then(|| {
            TieredCache::new(CacheOptions::memory_only(
                config.cache.query_cache_entries,
                config.cache.max_bytes,
            ))
        });
        let data_dir = config.general.data_dir_path();
        let cache = TieredCache::new(CacheOptions::from_config(&config.cache, &data_dir));

        info!(
            dimension = vector.dimension,
            metric = %vector.metric,
            persistent_cache = cache.is_persistent(),
            "Memory engine initialized"
        );

        Ok(Self {
            store: EntityStore::new(vector.dimension),
            index: VectorIndex::new(options),
            consolidation: ConsolidationEngine::new(config.consolidation.clone())?,
            query_cache,
            cache,
            plugins: RwLock::new(PluginRegistry::new()),
            gate: RwLock::new(()),
            config,
        })
    }

    pub fn config(&self) -> &MnemoConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// General-purpose cache for callers.
    pub fn cache(&self) -> &TieredCache<serde_json::Value> {
        &self.cache
    }

    pub fn register_plugin(&self, plugin: Box<dyn MemoryPlugin>) -> Result<()> {
        self.plugins.write().map_err(MnemoError::lock)?.register(plugin)
    }

    pub fn unregister_plugin(&self, name: &str) -> Result<bool> {
        Ok(self.plugins.write().map_err(MnemoError::lock)?.unregister(name))
    }

    fn invalidate_queries(&self) {
        if let Some(cache) = &self.query_cache {
            cache.clear();
        }
    }

    // ==================== Writes ====================

    /// Store content. Identical content returns the existing node with its
    /// access count bumped.
    pub fn add(
        &self,
        content: impl Into<Content>,
        node_type: impl Into<String>,
        embedding: Option<Vec<f32>>,
        metadata: Option<Metadata>,
    ) -> Result<Node> {
        let mut node = Node::new(content, node_type);
        node.embedding = embedding;
        node.metadata = metadata.unwrap_or_default();

        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        let outcome = self.store.insert(node)?;
        if !outcome.created {
            return Ok(outcome.node);
        }

        let node = outcome.node;
        if let Some(vector) = node.embedding.as_ref().filter(|_| node.active) {
            if let Err(e) = self.index.upsert(node.id, vector.clone()) {
                // Roll back the insert.
                self.store.remove_node(node.id)?;
                return Err(e);
            }
        }
        self.invalidate_queries();

        self.plugins
            .read()
            .map_err(MnemoError::lock)?
            .notify_added(&node);
        Ok(node)
    }

    /// Embed `text` with `embedder` and store it.
    ///
    /// If embedding fails the node is stored without a vector. Content that
    /// is already stored is not embedded again.
    pub async fn add_text<E: EmbeddingService>(
        &self,
        embedder: &E,
        text: &str,
        node_type: &str,
        metadata: Option<Metadata>,
    ) -> Result<Node> {
        let content = Content::from(text);
        if self.store.find_by_hash(&content.content_hash()).is_some() {
            return self.add(content, node_type, None, metadata);
        }

        let embedding = match embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, node_type, "Embedding failed; storing node without a vector");
                None
            }
        };
        self.add(content, node_type, embedding, metadata)
    }

    pub fn add_edge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        edge_type: impl Into<String>,
        weight: f64,
    ) -> Result<Edge> {
        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        self.store.add_edge(source_id, target_id, edge_type, weight)
    }

    /// Remove a node, its edges and its vector.
    pub fn remove(&self, id: Uuid) -> Result<Node> {
        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        let node = self.store.remove_node(id)?;
        self.index.remove(id)?;
        self.invalidate_queries();
        Ok(node)
    }

    pub fn reinforce(&self, id: Uuid, amount: f64) -> Result<Node> {
        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        let node = self
            .consolidation
            .reinforce(&self.store, &self.index, id, amount)?;
        self.invalidate_queries();
        Ok(node)
    }

    // ==================== Reads ====================

    pub fn get(&self, id: Uuid) -> Option<Node> {
        let _gate = self.gate.read().ok()?;
        self.store.get_node(id)
    }

    pub fn neighbors(&self, id: Uuid, edge_type: Option<&str>) -> Result<Vec<Node>> {
        let _gate = self.gate.read().map_err(MnemoError::lock)?;
        self.store.neighbors(id, edge_type)
    }

    /// Nearest neighbors using the configured search strategy.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let mode = self.config.vector.search.mode_for(self.index.len());
        self.query_with_mode(vector, k, mode)
    }

    /// Nearest neighbors in an explicit mode.
    ///
    /// Inactive, missing and plugin-rejected nodes are skipped; when that
    /// leaves fewer than `k` results the index is asked for more.
    pub fn query_with_mode(
        &self,
        vector: &[f32],
        k: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        let _gate = self.gate.read().map_err(MnemoError::lock)?;
        let plugins = self.plugins.read().map_err(MnemoError::lock)?;

        let mut fetch = k;
        loop {
            let hits = self.cached_hits(vector, fetch, mode)?;
            let exhausted = hits.len() < fetch;
            let mut results = self.resolve(hits, &plugins);
            if results.len() >= k || exhausted {
                results.truncate(k);
                return Ok(results);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Query with cancellation. Bypasses the query cache; a partial result
    /// is returned with `complete == false`.
    pub fn query_with_cancel(
        &self,
        vector: &[f32],
        k: usize,
        mode: SearchMode,
        cancel: &CancelToken,
    ) -> Result<SearchOutcome> {
        let _gate = self.gate.read().map_err(MnemoError::lock)?;
        let plugins = self.plugins.read().map_err(MnemoError::lock)?;
        let outcome = self.index.query_with_cancel(vector, k, mode, cancel)?;
        Ok(SearchOutcome {
            results: self.resolve(outcome.hits, &plugins),
            complete: outcome.complete,
            mode: outcome.mode,
        })
    }

    /// Embed `text` and query with it.
    pub async fn query_text<E: EmbeddingService>(
        &self,
        embedder: &E,
        text: &str,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        let vector = embedder.embed(text).await?;
        self.query(&vector, k)
    }

    /// Every node within `radius` of `vector`, nearest first.
    pub fn range_query(&self, vector: &[f32], radius: f32) -> Result<Vec<SearchResult>> {
        let _gate = self.gate.read().map_err(MnemoError::lock)?;
        let plugins = self.plugins.read().map_err(MnemoError::lock)?;
        let hits = self.index.range_query(vector, radius)?;
        Ok(self.resolve(hits, &plugins))
    }

    fn cached_hits(&self, vector: &[f32], k: usize, mode: SearchMode) -> Result<Vec<IndexHit>> {
        let Some(cache) = &self.query_cache else {
            return self.index.query(vector, k, mode);
        };
        let key = query_key(mode, k, vector);
        if let Some(hits) = cache.get(&key) {
            debug!(k, %mode, "Query cache hit");
            return Ok(hits);
        }
        let hits = self.index.query(vector, k, mode)?;
        if let Err(e) = cache.set(key, hits.clone(), None) {
            debug!(error = %e, "Query result not cached");
        }
        Ok(hits)
    }

    fn resolve(&self, hits: Vec<IndexHit>, plugins: &PluginRegistry) -> Vec<SearchResult> {
        hits.into_iter()
            .filter_map(|hit| {
                let node = self.store.get_node(hit.id)?;
                (node.active && plugins.accepts(&node)).then_some(SearchResult {
                    node,
                    distance: hit.distance,
                })
            })
            .collect()
    }

    // ==================== Consolidation ====================

    pub fn should_consolidate(&self) -> bool {
        self.consolidation.should_consolidate(self.store.len())
    }

    /// Run a consolidation pass now. A pass that cannot be committed comes
    /// back as a `Failed` report with the store untouched.
    pub fn consolidate(&self) -> Result<ConsolidationReport> {
        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        let plugins = self.plugins.read().map_err(MnemoError::lock)?;
        let adjust = |node: &Node, score: f64| plugins.adjust_importance(node, score);
        let report = self.consolidation.run(&self.store, &self.index, &adjust);
        self.invalidate_queries();
        Ok(report)
    }

    /// Consolidate only if the node count has reached the threshold.
    pub fn maybe_consolidate(&self) -> Result<Option<ConsolidationReport>> {
        if !self.should_consolidate() {
            return Ok(None);
        }
        self.consolidate().map(Some)
    }

    /// Apply the forgetting curve. `None` uses the configured half-life.
    pub fn apply_decay(&self, half_life_days: Option<f64>) -> Result<DecayReport> {
        let half_life = half_life_days.unwrap_or(self.config.consolidation.decay_half_life_days);
        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        let report = self
            .consolidation
            .apply_decay(&self.store, &self.index, half_life)?;
        self.invalidate_queries();
        Ok(report)
    }

    pub fn history(&self) -> Vec<ConsolidationReport> {
        self.consolidation.history()
    }

    pub fn last_report(&self) -> Option<ConsolidationReport> {
        self.consolidation.last_report()
    }

    // ==================== Snapshots ====================

    pub fn export_snapshot(&self) -> Result<Snapshot> {
        let _gate = self.gate.read().map_err(MnemoError::lock)?;
        self.store.to_snapshot(self.index.metric())
    }

    pub fn export_to_path(&self, path: &Path) -> Result<Snapshot> {
        let snapshot = self.export_snapshot()?;
        snapshot.write_to_path(path)?;
        Ok(snapshot)
    }

    /// Replace every node and edge with the snapshot's and rebuild the index.
    ///
    /// Nothing changes if the snapshot is rejected.
    pub fn import_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.metric != self.index.metric() {
            return Err(MnemoError::Config(format!(
                "snapshot metric {} does not match engine metric {}",
                snapshot.metric,
                self.index.metric()
            )));
        }
        let searchable: Vec<&Node> = snapshot.nodes.iter().filter(|n| n.is_searchable()).collect();
        if let Some(max) = self.config.vector.max_vectors {
            if searchable.len() > max {
                return Err(MnemoError::CapacityExceeded(format!(
                    "snapshot has {} searchable nodes, index holds at most {max}",
                    searchable.len()
                )));
            }
        }

        let _gate = self.gate.write().map_err(MnemoError::lock)?;
        self.store.replace_with(snapshot)?;
        self.index.clear()?;
        for node in searchable {
            if let Some(vector) = &node.embedding {
                self.index.upsert(node.id, vector.clone())?;
            }
        }
        self.invalidate_queries();

        info!(
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            vectors = self.index.len(),
            "Snapshot imported"
        );
        Ok(())
    }

    pub fn import_from_path(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot::read_from_path(path)?;
        self.import_snapshot(&snapshot)
    }

    // ==================== Stats ====================

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            index: self.index.stats(),
            query_cache: self
                .query_cache
                .as_ref()
                .map(|c| c.stats())
                .unwrap_or_default(),
            cache: self.cache.stats(),
            consolidation: self.consolidation.stats(),
            search_strategy: self.config.vector.search,
            plugins: self.plugins.read().map(|p| p.names()).unwrap_or_default(),
            consolidation_due: self.should_consolidate(),
        }
    }
}

/// `sha256(mode, k, vector)` as hex.
fn query_key(mode: SearchMode, k: usize, vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.to_string().as_bytes());
    hasher.update((k as u64).to_le_bytes());
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
