//! Mnemo Cache crate - bounded LRU/TTL memory tier with an optional on-disk tier.
//!
//! [`TieredCache`] is the public entry point. The memory tier is the source
//! of truth for hot entries; the disk tier is a best-effort spillover that
//! degrades to memory-only on any I/O trouble.

pub mod disk;
pub mod memory;
pub mod tiered;

pub use disk::DiskTier;
pub use memory::CacheEntry;
pub use tiered::{CacheOptions, CacheStats, TieredCache, DEFAULT_ENTRY_SIZE};
