//! Importance scoring and keep/prune partitioning.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mnemo_core::config::{ConsolidationConfig, ImportanceWeights};
use mnemo_core::types::Node;

/// The four score components and their weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub recency: f64,
    pub frequency: f64,
    pub connectivity: f64,
    pub explicit: f64,
    pub total: f64,
}

/// A node with the score it received in one pass.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f64,
}

/// `w_r·recency + w_f·frequency + w_c·connectivity + w_e·explicit`.
#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    weights: ImportanceWeights,
    recency_tau_hours: f64,
    frequency_saturation: f64,
    connectivity_saturation: f64,
}

impl ImportanceScorer {
    pub fn from_config(config: &ConsolidationConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            recency_tau_hours: config.recency_half_life_hours,
            frequency_saturation: config.frequency_saturation,
            connectivity_saturation: config.connectivity_saturation,
        }
    }

    pub fn score(&self, node: &Node, edge_count: usize, now: DateTime<Utc>) -> ScoreBreakdown {
        let age_hours = (now - node.last_accessed_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let recency = (-age_hours / self.recency_tau_hours).exp();
        let frequency = (node.access_count as f64 / self.frequency_saturation).min(1.0);
        let connectivity = (edge_count as f64 / self.connectivity_saturation).min(1.0);
        let explicit = node.importance.clamp(0.0, 1.0);

        let w = &self.weights;
        ScoreBreakdown {
            recency,
            frequency,
            connectivity,
            explicit,
            total: w.recency * recency
                + w.frequency * frequency
                + w.connectivity * connectivity
                + w.explicit * explicit,
        }
    }
}

/// Rank order: higher score first, then newer `created_at`, then id.
pub(crate) fn rank(a: &ScoredNode, b: &ScoredNode) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.node.created_at.cmp(&a.node.created_at))
        .then_with(|| a.node.id.cmp(&b.node.id))
}

/// Split scored nodes into `(kept, pruned)`.
///
/// Kept are the first `max_memories` in rank order whose score is at least
/// `threshold`. Everything else is pruned, including nodes above the
/// threshold that fall past the cap. Both halves come back in rank order.
pub fn partition(
    mut scored: Vec<ScoredNode>,
    max_memories: usize,
    threshold: f64,
) -> (Vec<ScoredNode>, Vec<ScoredNode>) {
    scored.sort_by(rank);
    let mut kept = Vec::new();
    let mut pruned = Vec::new();
    for entry in scored {
        if kept.len() < max_memories && entry.score >= threshold {
            kept.push(entry);
        } else {
            pruned.push(entry);
        }
    }
    (kept, pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scorer() -> ImportanceScorer {
        ImportanceScorer::from_config(&ConsolidationConfig::default())
    }

    fn scored(score: f64) -> ScoredNode {
        ScoredNode {
            node: Node::new(format!("n{score}"), "note"),
            score,
        }
    }

    #[test]
    fn test_fresh_node_score() {
        let node = Node::new("fresh", "note");
        let s = scorer().score(&node, 0, node.last_accessed_at);
        assert!((s.recency - 1.0).abs() < 1e-9);
        assert_eq!(s.frequency, 0.0);
        assert_eq!(s.connectivity, 0.0);
        assert!((s.total - (0.3 + 0.2 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_components_saturate() {
        let mut node = Node::new("busy", "note");
        node.access_count = 1_000;
        node.importance = 1.0;
        let s = scorer().score(&node, 99, node.last_accessed_at);
        assert_eq!(s.frequency, 1.0);
        assert_eq!(s.connectivity, 1.0);
        assert!((s.total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decays_with_age() {
        let node = Node::new("old", "note");
        let later = node.last_accessed_at + Duration::hours(72);
        let s = scorer().score(&node, 0, later);
        assert!((s.recency - (-1.0f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_partition_hard_cap_wins() {
        let nodes = vec![scored(0.9), scored(0.8), scored(0.7), scored(0.05)];
        let (kept, pruned) = partition(nodes, 2, 0.1);
        assert_eq!(kept.len(), 2);
        assert_eq!(pruned.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.8);
        assert!(pruned.iter().any(|s| s.score == 0.7));
    }

    #[test]
    fn test_partition_threshold() {
        let nodes = vec![scored(0.5), scored(0.09), scored(0.1)];
        let (kept, pruned) = partition(nodes, 10, 0.1);
        assert_eq!(kept.len(), 2);
        assert_eq!(pruned[0].score, 0.09);
    }

    #[test]
    fn test_ties_prefer_newer_nodes() {
        let mut older = scored(0.5);
        older.node.created_at = Utc::now() - Duration::days(1);
        let newer = scored(0.5);
        let newer_id = newer.node.id;
        let (kept, _) = partition(vec![older, newer], 1, 0.0);
        assert_eq!(kept[0].node.id, newer_id);
    }
}
