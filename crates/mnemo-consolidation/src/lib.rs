//! Mnemo Consolidation crate - importance scoring, pruning, merging, decay.
//!
//! A pass scores every node, keeps the best `max_memories` above the
//! importance threshold, merges near-duplicates among the kept set and
//! commits the result to the store in one step. Decay and reinforcement
//! move node strength along the forgetting curve between passes.

pub mod decay;
pub mod engine;
pub mod merge;
pub mod scoring;

pub use decay::{decay_factor, DecayReport};
pub use engine::{ConsolidationEngine, ConsolidationStats, PassPlan, ScoreAdjust};
pub use merge::{plan_merges, similarity, word_set};
pub use scoring::{partition, ImportanceScorer, ScoreBreakdown, ScoredNode};
