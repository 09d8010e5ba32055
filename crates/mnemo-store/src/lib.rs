//! Mnemo Store crate - node/edge graph with content-addressed deduplication.
//!
//! The [`EntityStore`] owns every [`Node`](mnemo_core::types::Node) and
//! [`Edge`](mnemo_core::types::Edge). Consolidation changes are applied
//! atomically through a [`ConsolidationPlan`]; whole-store persistence goes
//! through the versioned [`Snapshot`] format.

pub mod plan;
pub mod snapshot;
pub mod store;

pub use plan::{ConsolidationPlan, MergePlan};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{AddOutcome, EntityStore, StoreStats};
