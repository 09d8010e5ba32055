//! Mnemo Engine crate - the memory engine façade.
//!
//! [`MemoryEngine`] wires the entity store, vector index, caches and
//! consolidation engine together behind one handle. It is built explicitly
//! from a [`MnemoConfig`](mnemo_core::MnemoConfig) and shared as
//! `Arc<MemoryEngine>`; there is no global instance.

pub mod engine;
pub mod plugin;
pub mod stats;

pub use engine::{MemoryEngine, SearchOutcome, SearchResult};
pub use plugin::{Capability, MemoryPlugin, MetadataFilter, PluginRegistry, TypeBoost};
pub use stats::EngineStats;
