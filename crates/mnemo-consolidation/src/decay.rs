//! Forgetting curve: exponential strength decay with a half-life.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mnemo_core::types::Node;

/// Result of one `apply_decay` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayReport {
    pub applied_at: DateTime<Utc>,
    pub half_life_days: f64,
    /// Nodes whose strength was recomputed.
    pub examined: usize,
    /// Nodes that dropped below the strength floor in this call.
    pub deactivated: Vec<Uuid>,
    /// Mean strength over every node after decay.
    pub mean_strength: f64,
}

/// Multiplier `0.5^(elapsed_days / half_life_days)`.
pub fn decay_factor(elapsed_days: f64, half_life_days: f64) -> f64 {
    if elapsed_days <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(elapsed_days / half_life_days)
}

/// Decay `node` in place for the time since its last access or its last
/// decay, whichever is later, and stamp `decayed_at = now`. Returns true if
/// the node just became inactive.
pub(crate) fn decay_node(node: &mut Node, now: DateTime<Utc>, half_life_days: f64, floor: f64) -> bool {
    let from = node
        .decayed_at
        .map_or(node.last_accessed_at, |d| d.max(node.last_accessed_at));
    let elapsed_days = (now - from).num_milliseconds().max(0) as f64 / 86_400_000.0;
    node.strength = (node.strength * decay_factor(elapsed_days, half_life_days)).clamp(0.0, 1.0);
    node.decayed_at = Some(node.decayed_at.map_or(now, |d| d.max(now)));

    if node.active && node.strength < floor {
        node.active = false;
        return true;
    }
    false
}
