//! Mnemo Vector crate - nearest-neighbor index, distance metrics, embedding service.
//!
//! Provides an in-memory vector index answering exact (brute-force) and
//! approximate (IVF partitioned) k-nearest-neighbor and radius queries,
//! plus the embedding service trait through which callers supply vectors.

pub mod cancel;
pub mod distance;
pub mod embedding;
pub mod index;
pub mod ivf;

pub use cancel::CancelToken;
pub use embedding::{EmbeddingService, FnEmbedding};
#[cfg(any(test, feature = "test-util"))]
pub use embedding::MockEmbedding;
pub use index::{IndexHit, IndexStats, QueryOutcome, VectorIndex, VectorIndexOptions};
pub use ivf::{ApproximateIndex, IvfIndex, IvfParams};
