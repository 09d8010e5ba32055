//! In-memory node/edge store.
//!
//! Nodes are deduplicated by `content_hash`. Edges are indexed in both
//! directions with per-node adjacency lists kept in creation order, so
//! traversal order is stable. All state sits behind one `RwLock`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{Content, DistanceMetric, Edge, Metadata, Node};

use crate::plan::ConsolidationPlan;
use crate::snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};

/// Result of [`EntityStore::insert`].
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub node: Node,
    /// False when the content was already stored and the existing node was
    /// returned.
    pub created: bool,
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub active_nodes: usize,
    pub embedded_nodes: usize,
    pub edges: usize,
    /// Content hashes that resolve to a merge base instead of their own node.
    pub hash_aliases: usize,
    pub node_types: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: HashMap<Uuid, Node>,
    by_hash: HashMap<String, Uuid>,
    edges: HashMap<Uuid, Edge>,
    /// Edge ids per node, in creation order.
    outgoing: HashMap<Uuid, Vec<Uuid>>,
    incoming: HashMap<Uuid, Vec<Uuid>>,
}

impl StoreState {
    fn link(&mut self, edge: Edge) {
        self.outgoing.entry(edge.source_id).or_default().push(edge.id);
        self.incoming.entry(edge.target_id).or_default().push(edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn unlink(&mut self, edge_id: Uuid) -> Option<Edge> {
        let edge = self.edges.remove(&edge_id)?;
        if let Some(list) = self.outgoing.get_mut(&edge.source_id) {
            list.retain(|id| *id != edge_id);
        }
        if let Some(list) = self.incoming.get_mut(&edge.target_id) {
            list.retain(|id| *id != edge_id);
        }
        Some(edge)
    }

    fn edge_ids_of(&self, node_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.outgoing.get(&node_id).cloned().unwrap_or_default();
        for id in self.incoming.get(&node_id).into_iter().flatten() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    fn has_edge(&self, source: Uuid, target: Uuid, edge_type: &str) -> bool {
        self.outgoing.get(&source).is_some_and(|ids| {
            ids.iter().any(|id| {
                self.edges
                    .get(id)
                    .is_some_and(|e| e.target_id == target && e.edge_type == edge_type)
            })
        })
    }

    /// Remove a node with its edges and every hash entry resolving to it.
    fn remove_node(&mut self, id: Uuid) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        for edge_id in self.edge_ids_of(id) {
            self.unlink(edge_id);
        }
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
        self.by_hash.retain(|_, target| *target != id);
        Some(node)
    }

    /// Move every edge of `from` onto `to`, dropping self loops and edges
    /// that would duplicate an existing (source, target, type) triple.
    fn repoint_edges(&mut self, from: Uuid, to: Uuid) {
        for edge_id in self.edge_ids_of(from) {
            let Some(mut edge) = self.unlink(edge_id) else {
                continue;
            };
            if edge.source_id == from {
                edge.source_id = to;
            }
            if edge.target_id == from {
                edge.target_id = to;
            }
            if edge.source_id == edge.target_id
                || self.has_edge(edge.source_id, edge.target_id, &edge.edge_type)
            {
                continue;
            }
            self.link(edge);
        }
    }
}

/// Thread-safe owner of all nodes and edges.
#[derive(Debug)]
pub struct EntityStore {
    dimension: usize,
    state: RwLock<StoreState>,
}

impl EntityStore {
    /// Create an empty store whose embeddings must have `dimension` entries.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_embedding(&self, embedding: Option<&Vec<f32>>) -> Result<()> {
        match embedding {
            Some(v) if v.len() != self.dimension => Err(MnemoError::Dimension {
                expected: self.dimension,
                actual: v.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Add content, returning the stored node. Identical content returns the
    /// existing node with its `access_count` bumped.
    pub fn add_node(
        &self,
        content: impl Into<Content>,
        node_type: impl Into<String>,
        embedding: Option<Vec<f32>>,
        metadata: Option<Metadata>,
    ) -> Result<Node> {
        let mut node = Node::new(content, node_type);
        node.embedding = embedding;
        node.metadata = metadata.unwrap_or_default();
        Ok(self.insert(node)?.node)
    }

    /// Insert a fully built node, deduplicating by `content_hash`.
    ///
    /// The hash is recomputed from `content`, so callers cannot smuggle in a
    /// stale one.
    pub fn insert(&self, mut node: Node) -> Result<AddOutcome> {
        self.check_embedding(node.embedding.as_ref())?;
        node.content_hash = node.content.content_hash();

        let mut state = self.state.write().map_err(MnemoError::lock)?;
        if let Some(existing_id) = state.by_hash.get(&node.content_hash).copied() {
            if let Some(existing) = state.nodes.get_mut(&existing_id) {
                existing.access_count += 1;
                debug!(id = %existing_id, "Duplicate content; returning existing node");
                return Ok(AddOutcome {
                    node: existing.clone(),
                    created: false,
                });
            }
        }

        state.by_hash.insert(node.content_hash.clone(), node.id);
        state.nodes.insert(node.id, node.clone());
        debug!(id = %node.id, node_type = %node.node_type, "Node added");
        Ok(AddOutcome {
            node,
            created: true,
        })
    }

    /// Add a directed edge. Both endpoints must exist.
    pub fn add_edge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        edge_type: impl Into<String>,
        weight: f64,
    ) -> Result<Edge> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        for id in [source_id, target_id] {
            if !state.nodes.contains_key(&id) {
                return Err(MnemoError::node_not_found(id));
            }
        }
        let edge = Edge::new(source_id, target_id, edge_type, weight);
        state.link(edge.clone());
        Ok(edge)
    }

    pub fn get_node(&self, id: Uuid) -> Option<Node> {
        self.state.read().ok()?.nodes.get(&id).cloned()
    }

    pub fn get_edge(&self, id: Uuid) -> Option<Edge> {
        self.state.read().ok()?.edges.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.state
            .read()
            .map(|s| s.nodes.contains_key(&id))
            .unwrap_or(false)
    }

    /// The node a content hash resolves to, following merge aliases.
    pub fn find_by_hash(&self, hash: &str) -> Option<Node> {
        let state = self.state.read().ok()?;
        let id = state.by_hash.get(hash)?;
        state.nodes.get(id).cloned()
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&self, id: Uuid) -> Result<Node> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        let node = state
            .remove_node(id)
            .ok_or_else(|| MnemoError::node_not_found(id))?;
        debug!(id = %id, "Node removed");
        Ok(node)
    }

    pub fn remove_edge(&self, id: Uuid) -> Result<Edge> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        state.unlink(id).ok_or_else(|| MnemoError::edge_not_found(id))
    }

    /// Nodes reachable over one edge: outgoing first, then incoming, each in
    /// edge creation order. A node reachable over several edges appears once.
    pub fn neighbors(&self, id: Uuid, edge_type: Option<&str>) -> Result<Vec<Node>> {
        let state = self.state.read().map_err(MnemoError::lock)?;
        if !state.nodes.contains_key(&id) {
            return Err(MnemoError::node_not_found(id));
        }

        let outgoing = state.outgoing.get(&id).into_iter().flatten();
        let incoming = state.incoming.get(&id).into_iter().flatten();

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for edge_id in outgoing.chain(incoming) {
            let Some(edge) = state.edges.get(edge_id) else {
                continue;
            };
            if edge_type.is_some_and(|t| t != edge.edge_type) {
                continue;
            }
            let Some(other) = edge.other(id) else {
                continue;
            };
            if other == id || !seen.insert(other) {
                continue;
            }
            if let Some(node) = state.nodes.get(&other) {
                result.push(node.clone());
            }
        }
        Ok(result)
    }

    /// Every edge touching `id`, outgoing first.
    pub fn edges_of(&self, id: Uuid) -> Result<Vec<Edge>> {
        let state = self.state.read().map_err(MnemoError::lock)?;
        if !state.nodes.contains_key(&id) {
            return Err(MnemoError::node_not_found(id));
        }
        Ok(state
            .edge_ids_of(id)
            .iter()
            .filter_map(|edge_id| state.edges.get(edge_id).cloned())
            .collect())
    }

    /// Number of edges touching `id`. Zero for unknown ids.
    pub fn edge_count(&self, id: Uuid) -> usize {
        self.state
            .read()
            .map(|s| s.edge_ids_of(id).len())
            .unwrap_or(0)
    }

    /// Mutate a node in place and return the updated copy.
    ///
    /// `f` must not change `id` or `content`. Both are restored if it does.
    pub fn update_node<F>(&self, id: Uuid, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node),
    {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| MnemoError::node_not_found(id))?;
        let (original_id, original_content) = (node.id, node.content.clone());
        f(node);
        node.id = original_id;
        node.content = original_content;
        Ok(node.clone())
    }

    /// Copies of every node, in no particular order.
    pub fn nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .map(|s| s.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Copies of every edge, in no particular order.
    pub fn edges(&self) -> Vec<Edge> {
        self.state
            .read()
            .map(|s| s.edges.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A consistent copy of every node together with its edge count, taken
    /// under one read lock.
    pub fn nodes_with_edge_counts(&self) -> Result<Vec<(Node, usize)>> {
        let state = self.state.read().map_err(MnemoError::lock)?;
        Ok(state
            .nodes
            .values()
            .map(|n| (n.clone(), state.edge_ids_of(n.id).len()))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn edge_total(&self) -> usize {
        self.state.read().map(|s| s.edges.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let Ok(state) = self.state.read() else {
            return StoreStats::default();
        };
        let mut node_types = BTreeMap::new();
        for node in state.nodes.values() {
            *node_types.entry(node.node_type.clone()).or_insert(0) += 1;
        }
        let hash_aliases = state
            .by_hash
            .iter()
            .filter(|(hash, id)| state.nodes.get(*id).is_some_and(|n| &n.content_hash != *hash))
            .count();
        StoreStats {
            nodes: state.nodes.len(),
            active_nodes: state.nodes.values().filter(|n| n.active).count(),
            embedded_nodes: state.nodes.values().filter(|n| n.embedding.is_some()).count(),
            edges: state.edges.len(),
            hash_aliases,
            node_types,
        }
    }

    /// Commit a consolidation plan.
    ///
    /// Every id is validated first; any problem returns an error with the
    /// store untouched. Otherwise prunes and merges are applied under one
    /// write lock, so no reader ever observes a partial merge.
    pub fn apply_consolidation(&self, plan: &ConsolidationPlan) -> Result<()> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;

        if let Some(dup) = plan.first_duplicate() {
            return Err(MnemoError::Config(format!(
                "consolidation plan names node {dup} more than once"
            )));
        }
        for id in plan.referenced_ids() {
            if !state.nodes.contains_key(&id) {
                return Err(MnemoError::node_not_found(id));
            }
        }
        for merge in &plan.merges {
            self.check_embedding(merge.base.embedding.as_ref())?;
        }

        for id in &plan.prune {
            state.remove_node(*id);
        }

        for merge in &plan.merges {
            let base_id = merge.base.id;
            for absorbed in &merge.absorbed {
                state.repoint_edges(*absorbed, base_id);
                // The absorbed hash, and any aliases it already carried, now
                // resolve to the base.
                for target in state.by_hash.values_mut() {
                    if *target == *absorbed {
                        *target = base_id;
                    }
                }
                state.remove_node(*absorbed);
            }
            if let Some(slot) = state.nodes.get_mut(&base_id) {
                let (content, hash) = (slot.content.clone(), slot.content_hash.clone());
                *slot = merge.base.clone();
                slot.content = content;
                slot.content_hash = hash;
            }
        }

        info!(
            pruned = plan.prune.len(),
            merge_groups = plan.merges.len(),
            remaining = state.nodes.len(),
            "Consolidation plan applied"
        );
        Ok(())
    }

    // ==================== Snapshots ====================

    /// Serialize the whole store. Nodes and edges are ordered by creation
    /// time (then id) so equal stores produce equal snapshots.
    pub fn to_snapshot(&self, metric: DistanceMetric) -> Result<Snapshot> {
        let state = self.state.read().map_err(MnemoError::lock)?;

        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        // Edges in adjacency order so creation order survives the round trip.
        let mut edges = Vec::with_capacity(state.edges.len());
        for node in &nodes {
            for edge_id in state.outgoing.get(&node.id).into_iter().flatten() {
                if let Some(edge) = state.edges.get(edge_id) {
                    edges.push(edge.clone());
                }
            }
        }

        let aliases = state
            .by_hash
            .iter()
            .filter(|(hash, id)| state.nodes.get(*id).is_some_and(|n| &n.content_hash != *hash))
            .map(|(hash, id)| (hash.clone(), *id))
            .collect();

        Ok(Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            dimension: self.dimension,
            metric,
            exported_at: Utc::now(),
            nodes,
            edges,
            aliases,
        })
    }

    /// Build a fresh store from a snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let store = Self::new(snapshot.dimension);
        store.replace_with(snapshot)?;
        Ok(store)
    }

    /// Replace the entire contents with `snapshot`. The snapshot is
    /// validated in full before anything is swapped in.
    pub fn replace_with(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(MnemoError::IncompatibleFormat {
                found: snapshot.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        if snapshot.dimension != self.dimension {
            return Err(MnemoError::Dimension {
                expected: self.dimension,
                actual: snapshot.dimension,
            });
        }

        let mut fresh = StoreState::default();
        for node in &snapshot.nodes {
            self.check_embedding(node.embedding.as_ref())?;
            let mut node = node.clone();
            node.content_hash = node.content.content_hash();
            fresh.by_hash.insert(node.content_hash.clone(), node.id);
            fresh.nodes.insert(node.id, node);
        }
        for edge in &snapshot.edges {
            for id in [edge.source_id, edge.target_id] {
                if !fresh.nodes.contains_key(&id) {
                    return Err(MnemoError::node_not_found(id));
                }
            }
            fresh.link(edge.clone());
        }
        for (hash, id) in &snapshot.aliases {
            if fresh.nodes.contains_key(id) {
                fresh.by_hash.entry(hash.clone()).or_insert(*id);
            }
        }

        let mut state = self.state.write().map_err(MnemoError::lock)?;
        *state = fresh;
        info!(
            nodes = state.nodes.len(),
            edges = state.edges.len(),
            "Store loaded from snapshot"
        );
        Ok(())
    }
}
