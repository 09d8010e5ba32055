//! In-memory vector index with exact and approximate search.
//!
//! Exact mode is a brute-force scan and is always correct. Approximate mode
//! asks an [`ApproximateIndex`] backend for candidates and re-ranks them
//! exactly. The backend is trained lazily on the first approximate query and
//! retrained once the corpus has doubled since the last training run.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{DistanceMetric, SearchMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::distance::distance;
use crate::ivf::{ApproximateIndex, IvfIndex, IvfParams};

/// How many vectors an exact scan visits between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// A single hit returned from a vector query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub id: Uuid,
    /// Distance under the index metric. Smaller is closer.
    pub distance: f32,
}

/// Result of a cancellable query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Best hits among the vectors visited before the token fired.
    pub hits: Vec<IndexHit>,
    /// False when the scan stopped early.
    pub complete: bool,
    /// The mode that actually answered (approximate may fall back to exact).
    pub mode: SearchMode,
}

/// Construction options for [`VectorIndex`].
#[derive(Debug, Clone)]
pub struct VectorIndexOptions {
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// Hard cap on stored vectors. `None` means unbounded.
    pub max_vectors: Option<usize>,
    pub ivf: IvfParams,
}

impl VectorIndexOptions {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::Cosine,
            max_vectors: None,
            ivf: IvfParams::default(),
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_max_vectors(mut self, max_vectors: usize) -> Self {
        self.max_vectors = Some(max_vectors);
        self
    }

    pub fn with_ivf(mut self, ivf: IvfParams) -> Self {
        self.ivf = ivf;
        self
    }
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub max_vectors: Option<usize>,
    pub approximate_backend: String,
    pub approximate_trained: bool,
    pub trained_on: usize,
    pub partitions: usize,
    pub exact_queries: u64,
    pub approximate_queries: u64,
    /// Approximate queries answered exactly because the corpus was too small.
    pub fallback_queries: u64,
    pub cancelled_queries: u64,
}

#[derive(Debug, Default)]
struct QueryCounters {
    exact: AtomicU64,
    approximate: AtomicU64,
    fallback: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug)]
struct IndexState {
    vectors: HashMap<Uuid, Vec<f32>>,
    ann: Box<dyn ApproximateIndex>,
}

impl IndexState {
    fn needs_training(&self) -> bool {
        !self.ann.is_trained() || self.vectors.len() >= self.ann.trained_on().saturating_mul(2)
    }

    fn below_training_size(&self) -> bool {
        self.vectors.len() < self.ann.min_training_size()
    }
}

/// Thread-safe vector index.
///
/// Cloning yields another handle onto the same index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    metric: DistanceMetric,
    max_vectors: Option<usize>,
    state: Arc<RwLock<IndexState>>,
    counters: Arc<QueryCounters>,
}

impl VectorIndex {
    /// Create an empty index with the default IVF backend.
    pub fn new(options: VectorIndexOptions) -> Self {
        let backend = Box::new(IvfIndex::new(options.metric, options.ivf.clone()));
        Self::with_backend(options, backend)
    }

    /// Create an empty index with a caller-supplied approximate backend.
    pub fn with_backend(options: VectorIndexOptions, backend: Box<dyn ApproximateIndex>) -> Self {
        Self {
            dimension: options.dimension,
            metric: options.metric,
            max_vectors: options.max_vectors,
            state: Arc::new(RwLock::new(IndexState {
                vectors: HashMap::new(),
                ann: backend,
            })),
            counters: Arc::new(QueryCounters::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MnemoError::Dimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or replace the vector for `id`.
    pub fn upsert(&self, id: Uuid, vector: Vec<f32>) -> Result<()> {
        self.check_dimension(&vector)?;
        let mut state = self.state.write().map_err(MnemoError::lock)?;

        if !state.vectors.contains_key(&id) {
            if let Some(max) = self.max_vectors {
                if state.vectors.len() >= max {
                    return Err(MnemoError::CapacityExceeded(format!(
                        "vector index holds the maximum of {max} vectors"
                    )));
                }
            }
        }

        if state.ann.is_trained() {
            state.ann.insert(id, &vector);
        }
        state.vectors.insert(id, vector);
        Ok(())
    }

    /// Remove the vector for `id`. Absent ids are ignored.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        if state.vectors.remove(&id).is_some() {
            state.ann.remove(id);
        }
        Ok(())
    }

    /// Drop every vector and any trained approximate state.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        state.vectors.clear();
        state.ann.reset();
        Ok(())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.state
            .read()
            .map(|s| s.vectors.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn get(&self, id: Uuid) -> Option<Vec<f32>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.vectors.get(&id).cloned())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.vectors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` nearest vectors, sorted by ascending distance (ties by id).
    pub fn query(&self, vector: &[f32], k: usize, mode: SearchMode) -> Result<Vec<IndexHit>> {
        Ok(self
            .query_with_cancel(vector, k, mode, &CancelToken::new())?
            .hits)
    }

    /// Like [`query`](Self::query), but stops early once `cancel` fires and
    /// returns the best hits found so far with `complete == false`.
    pub fn query_with_cancel(
        &self,
        vector: &[f32],
        k: usize,
        mode: SearchMode,
        cancel: &CancelToken,
    ) -> Result<QueryOutcome> {
        self.check_dimension(vector)?;
        if k == 0 {
            return Ok(QueryOutcome {
                hits: Vec::new(),
                complete: true,
                mode,
            });
        }

        let outcome = match mode {
            SearchMode::Exact => {
                self.counters.exact.fetch_add(1, Ordering::Relaxed);
                let state = self.state.read().map_err(MnemoError::lock)?;
                self.scan(state.vectors.iter(), vector, k, cancel, SearchMode::Exact)
            }
            SearchMode::Approximate => self.approximate(vector, k, cancel)?,
        };

        if !outcome.complete {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(
                k,
                returned = outcome.hits.len(),
                "Vector query stopped early by cancel token"
            );
        }
        Ok(outcome)
    }

    fn approximate(&self, vector: &[f32], k: usize, cancel: &CancelToken) -> Result<QueryOutcome> {
        {
            let state = self.state.read().map_err(MnemoError::lock)?;
            if state.below_training_size() {
                self.counters.fallback.fetch_add(1, Ordering::Relaxed);
                return Ok(self.scan(state.vectors.iter(), vector, k, cancel, SearchMode::Exact));
            }
            if !state.needs_training() {
                self.counters.approximate.fetch_add(1, Ordering::Relaxed);
                return Ok(self.search_candidates(&state, vector, k, cancel));
            }
        }

        let mut state = self.state.write().map_err(MnemoError::lock)?;
        // Another caller may have trained while we waited for the lock.
        if state.needs_training() {
            Self::train(&mut state);
        }
        self.counters.approximate.fetch_add(1, Ordering::Relaxed);
        Ok(self.search_candidates(&state, vector, k, cancel))
    }

    fn search_candidates(
        &self,
        state: &IndexState,
        vector: &[f32],
        k: usize,
        cancel: &CancelToken,
    ) -> QueryOutcome {
        let candidates = state.ann.candidates(vector, k);
        let entries = candidates
            .iter()
            .filter_map(|id| state.vectors.get_key_value(id));
        self.scan(entries, vector, k, cancel, SearchMode::Approximate)
    }

    fn train(state: &mut IndexState) {
        let IndexState { vectors, ann } = state;
        ann.train(vectors);
        info!(
            backend = ann.name(),
            vectors = vectors.len(),
            partitions = ann.partitions(),
            "Approximate index trained"
        );
    }

    /// Force an approximate-backend rebuild now. Returns false when the
    /// corpus is below the backend's minimum training size.
    pub fn rebuild_approximate(&self) -> Result<bool> {
        let mut state = self.state.write().map_err(MnemoError::lock)?;
        if state.below_training_size() {
            return Ok(false);
        }
        Self::train(&mut state);
        Ok(true)
    }

    /// Every vector within `radius` of `vector`, sorted ascending.
    pub fn range_query(&self, vector: &[f32], radius: f32) -> Result<Vec<IndexHit>> {
        self.check_dimension(vector)?;
        let state = self.state.read().map_err(MnemoError::lock)?;
        let mut hits: Vec<IndexHit> = state
            .vectors
            .iter()
            .filter_map(|(id, stored)| {
                let d = distance(self.metric, vector, stored);
                (d <= radius).then_some(IndexHit { id: *id, distance: d })
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    fn scan<'a>(
        &self,
        entries: impl Iterator<Item = (&'a Uuid, &'a Vec<f32>)>,
        vector: &[f32],
        k: usize,
        cancel: &CancelToken,
        mode: SearchMode,
    ) -> QueryOutcome {
        // Max-heap of the best `k` so far; the root is the worst kept hit.
        let mut best: BinaryHeap<Ranked> = BinaryHeap::new();
        let mut complete = true;
        for (visited, (id, stored)) in entries.enumerate() {
            if visited % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                complete = false;
                break;
            }
            let hit = Ranked(IndexHit {
                id: *id,
                distance: distance(self.metric, vector, stored),
            });
            if best.len() < k {
                best.push(hit);
            } else if let Some(mut worst) = best.peek_mut() {
                if hit < *worst {
                    *worst = hit;
                }
            }
        }
        QueryOutcome {
            hits: best.into_sorted_vec().into_iter().map(|r| r.0).collect(),
            complete,
            mode,
        }
    }

    pub fn stats(&self) -> IndexStats {
        let (vectors, backend, trained, trained_on, partitions) = match self.state.read() {
            Ok(s) => (
                s.vectors.len(),
                s.ann.name().to_string(),
                s.ann.is_trained(),
                s.ann.trained_on(),
                s.ann.partitions(),
            ),
            Err(_) => (0, String::new(), false, 0, 0),
        };
        IndexStats {
            vectors,
            dimension: self.dimension,
            metric: self.metric,
            max_vectors: self.max_vectors,
            approximate_backend: backend,
            approximate_trained: trained,
            trained_on,
            partitions,
            exact_queries: self.counters.exact.load(Ordering::Relaxed),
            approximate_queries: self.counters.approximate.load(Ordering::Relaxed),
            fallback_queries: self.counters.fallback.load(Ordering::Relaxed),
            cancelled_queries: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

fn sort_hits(hits: &mut [IndexHit]) {
    hits.sort_by(compare_hits);
}

/// Ascending distance, ties broken by id.
fn compare_hits(a: &IndexHit, b: &IndexHit) -> CmpOrdering {
    a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id))
}

/// [`IndexHit`] ordered by [`compare_hits`] for the top-k heap.
struct Ranked(IndexHit);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        compare_hits(&self.0, &other.0)
    }
}
