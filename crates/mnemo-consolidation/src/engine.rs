//! Consolidation passes, decay and reinforcement over a store/index pair.
//!
//! A pass never mutates while it thinks: scoring, partitioning and merge
//! planning produce a [`PassPlan`], which is then committed through
//! [`EntityStore::apply_consolidation`] in one exclusive section. If the
//! commit is rejected the store keeps its pre-pass state and the pass is
//! recorded as failed.

use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mnemo_core::config::ConsolidationConfig;
use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{ConsolidationReport, MergeRecord, Node, ReportStatus};
use mnemo_store::{ConsolidationPlan, EntityStore};
use mnemo_vector::VectorIndex;

use crate::decay::{decay_node, DecayReport};
use crate::merge::plan_merges;
use crate::scoring::{partition, ImportanceScorer, ScoredNode};

/// Score hook applied after the built-in formula, e.g. by plugins.
pub type ScoreAdjust<'a> = &'a dyn Fn(&Node, f64) -> f64;

/// A computed but uncommitted consolidation pass.
#[derive(Debug, Clone)]
pub struct PassPlan {
    pub original_count: usize,
    /// Mean score over every node considered.
    pub avg_importance: f64,
    pub kept: Vec<ScoredNode>,
    pub pruned: Vec<ScoredNode>,
    pub plan: ConsolidationPlan,
}

/// Aggregate counters over the pass history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationStats {
    pub passes: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_pruned: usize,
    pub total_merged: usize,
    pub last_report: Option<ConsolidationReport>,
    pub last_decay: Option<DecayReport>,
}

#[derive(Debug)]
pub struct ConsolidationEngine {
    config: ConsolidationConfig,
    scorer: ImportanceScorer,
    history: RwLock<Vec<ConsolidationReport>>,
    last_decay: RwLock<Option<DecayReport>>,
}

impl ConsolidationEngine {
    /// Create an engine. Rejects weights that do not sum to 1.
    pub fn new(config: ConsolidationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scorer: ImportanceScorer::from_config(&config),
            config,
            history: RwLock::new(Vec::new()),
            last_decay: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    pub fn scorer(&self) -> &ImportanceScorer {
        &self.scorer
    }

    /// True once `current_count` reaches the configured threshold.
    pub fn should_consolidate(&self, current_count: usize) -> bool {
        current_count >= self.config.consolidation_threshold
    }

    /// Score, partition and plan merges without touching the store.
    pub fn plan(&self, store: &EntityStore, adjust: ScoreAdjust<'_>) -> Result<PassPlan> {
        let now = Utc::now();
        let snapshot = store.nodes_with_edge_counts()?;
        let original_count = snapshot.len();

        let scored: Vec<ScoredNode> = snapshot
            .into_iter()
            .map(|(node, edges)| {
                let base = self.scorer.score(&node, edges, now).total;
                let score = adjust(&node, base);
                ScoredNode { node, score }
            })
            .collect();

        let avg_importance = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|s| s.score).sum::<f64>() / original_count as f64
        };

        let (kept, pruned) = partition(
            scored,
            self.config.max_memories,
            self.config.importance_threshold,
        );

        let kept_nodes: Vec<Node> = kept.iter().map(|s| s.node.clone()).collect();
        let merges = plan_merges(
            &kept_nodes,
            self.config.similarity_threshold,
            self.config.merge_time_scale_hours,
        );

        debug!(
            original = original_count,
            kept = kept.len(),
            pruned = pruned.len(),
            merge_groups = merges.len(),
            "Consolidation pass planned"
        );

        Ok(PassPlan {
            original_count,
            avg_importance,
            plan: ConsolidationPlan {
                prune: pruned.iter().map(|s| s.node.id).collect(),
                merges,
            },
            kept,
            pruned,
        })
    }

    /// Run a full pass and append its report to the history.
    pub fn run(
        &self,
        store: &EntityStore,
        index: &VectorIndex,
        adjust: ScoreAdjust<'_>,
    ) -> ConsolidationReport {
        let started_at = Utc::now();
        match self.plan(store, adjust) {
            Ok(pass) => self.commit_from(store, index, pass, started_at),
            Err(e) => self.record_failure(started_at, 0, e),
        }
    }

    /// Commit a previously computed plan.
    ///
    /// The store may have changed since `pass` was planned; a plan naming a
    /// node that no longer exists is rejected as a whole.
    pub fn commit(
        &self,
        store: &EntityStore,
        index: &VectorIndex,
        pass: PassPlan,
    ) -> ConsolidationReport {
        self.commit_from(store, index, pass, Utc::now())
    }

    fn commit_from(
        &self,
        store: &EntityStore,
        index: &VectorIndex,
        pass: PassPlan,
        started_at: chrono::DateTime<Utc>,
    ) -> ConsolidationReport {
        if let Err(e) = store.apply_consolidation(&pass.plan) {
            return self.record_failure(started_at, pass.original_count, e);
        }

        for id in pass.plan.removed_ids() {
            if let Err(e) = index.remove(id) {
                warn!(id = %id, error = %e, "Failed to drop vector of removed node");
            }
        }
        for merge in &pass.plan.merges {
            let result = match (&merge.base.embedding, merge.base.active) {
                (Some(vector), true) => index.upsert(merge.base.id, vector.clone()),
                _ => index.remove(merge.base.id),
            };
            if let Err(e) = result {
                warn!(id = %merge.base.id, error = %e, "Failed to re-index merged node");
            }
        }

        let merged_count = pass.plan.merges.iter().map(|m| m.absorbed.len()).sum();
        let report = ConsolidationReport {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            original_count: pass.original_count,
            kept_count: pass.kept.len(),
            pruned_count: pass.pruned.len(),
            merged_count,
            avg_importance: pass.avg_importance,
            pruned_ids: pass.plan.prune.clone(),
            merges: pass
                .plan
                .merges
                .iter()
                .map(|m| MergeRecord {
                    base_id: m.base.id,
                    absorbed_ids: m.absorbed.clone(),
                })
                .collect(),
            status: ReportStatus::Completed,
        };

        info!(
            original = report.original_count,
            kept = report.kept_count,
            pruned = report.pruned_count,
            merged = report.merged_count,
            avg_importance = report.avg_importance,
            "Consolidation pass completed"
        );
        self.push_report(report.clone());
        report
    }

    fn record_failure(
        &self,
        started_at: chrono::DateTime<Utc>,
        original_count: usize,
        error: MnemoError,
    ) -> ConsolidationReport {
        warn!(error = %error, "Consolidation pass failed; store left unchanged");
        let report = ConsolidationReport {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            original_count,
            kept_count: original_count,
            pruned_count: 0,
            merged_count: 0,
            avg_importance: 0.0,
            pruned_ids: Vec::new(),
            merges: Vec::new(),
            status: ReportStatus::Failed {
                reason: error.to_string(),
            },
        };
        self.push_report(report.clone());
        report
    }

    fn push_report(&self, report: ConsolidationReport) {
        match self.history.write() {
            Ok(mut history) => history.push(report),
            Err(e) => warn!(error = %e, "Consolidation history lock poisoned; report dropped"),
        }
    }

    // ==================== Forgetting curve ====================

    /// Decay every node's strength with the given half-life.
    ///
    /// Elapsed time is measured from the later of the node's last access and
    /// its `decayed_at` stamp, which travels with the node through
    /// snapshots. Nodes that fall below the strength floor turn inactive and
    /// leave the index.
    pub fn apply_decay(
        &self,
        store: &EntityStore,
        index: &VectorIndex,
        half_life_days: f64,
    ) -> Result<DecayReport> {
        if half_life_days.is_nan() || half_life_days <= 0.0 {
            return Err(MnemoError::Config(format!(
                "half_life_days must be > 0, got {half_life_days}"
            )));
        }

        let now = Utc::now();
        let floor = self.config.strength_floor;

        let ids: Vec<Uuid> = store.nodes().into_iter().map(|n| n.id).collect();
        let mut deactivated = Vec::new();
        let mut strength_sum = 0.0;
        for id in &ids {
            let mut dropped = false;
            let node = store.update_node(*id, |node| {
                dropped = decay_node(node, now, half_life_days, floor);
            })?;
            strength_sum += node.strength;
            if dropped {
                index.remove(*id)?;
                deactivated.push(*id);
            }
        }

        let report = DecayReport {
            applied_at: now,
            half_life_days,
            examined: ids.len(),
            mean_strength: if ids.is_empty() {
                0.0
            } else {
                strength_sum / ids.len() as f64
            },
            deactivated,
        };
        info!(
            examined = report.examined,
            deactivated = report.deactivated.len(),
            mean_strength = report.mean_strength,
            "Decay applied"
        );
        *self.last_decay.write().map_err(MnemoError::lock)? = Some(report.clone());
        Ok(report)
    }

    /// Strengthen a node after use.
    ///
    /// An inactive node whose strength climbs back to the floor rejoins the
    /// active set and its vector is indexed again.
    pub fn reinforce(
        &self,
        store: &EntityStore,
        index: &VectorIndex,
        id: Uuid,
        amount: f64,
    ) -> Result<Node> {
        let floor = self.config.strength_floor;
        let node = store.update_node(id, |node| {
            node.strength = (node.strength + amount).clamp(0.0, 1.0);
            node.importance = (node.importance + amount / 2.0).clamp(0.0, 1.0);
            node.last_accessed_at = Utc::now();
            node.access_count += 1;
            node.active = node.strength >= floor;
        })?;

        match (&node.embedding, node.active) {
            (Some(vector), true) => index.upsert(id, vector.clone())?,
            _ => index.remove(id)?,
        }
        debug!(id = %id, strength = node.strength, active = node.active, "Node reinforced");
        Ok(node)
    }

    // ==================== History ====================

    /// Every report so far, oldest first.
    pub fn history(&self) -> Vec<ConsolidationReport> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn last_report(&self) -> Option<ConsolidationReport> {
        self.history.read().ok()?.last().cloned()
    }

    pub fn last_decay(&self) -> Option<DecayReport> {
        self.last_decay.read().ok()?.clone()
    }

    pub fn stats(&self) -> ConsolidationStats {
        let history = self.history();
        let completed: Vec<&ConsolidationReport> =
            history.iter().filter(|r| r.is_completed()).collect();
        ConsolidationStats {
            passes: history.len(),
            completed: completed.len(),
            failed: history.len() - completed.len(),
            total_pruned: completed.iter().map(|r| r.pruned_count).sum(),
            total_merged: completed.iter().map(|r| r.merged_count).sum(),
            last_report: history.last().cloned(),
            last_decay: self.last_decay(),
        }
    }
}
