//! Inverted-file (IVF) approximate nearest-neighbor backend.
//!
//! Vectors are grouped into partitions around k-means centroids. A query
//! probes the `probes` closest partitions and returns their members as
//! candidates; the caller re-ranks candidates with the exact metric.

use std::collections::HashMap;

use mnemo_core::types::DistanceMetric;
use tracing::debug;
use uuid::Uuid;

use crate::distance::distance;

/// A pluggable approximate nearest-neighbor structure.
///
/// Backends only propose candidates. Distances and the final top-k cut are
/// computed by [`VectorIndex`](crate::VectorIndex) against the stored
/// vectors, so a backend never needs to own vector data.
pub trait ApproximateIndex: Send + Sync + std::fmt::Debug {
    /// Short name for statistics.
    fn name(&self) -> &'static str;

    /// Rebuild from scratch over `vectors`.
    fn train(&mut self, vectors: &HashMap<Uuid, Vec<f32>>);

    /// Place a new or updated vector. Only called once trained.
    fn insert(&mut self, id: Uuid, vector: &[f32]);

    fn remove(&mut self, id: Uuid);

    /// Drop all trained state.
    fn reset(&mut self);

    /// Candidate ids for a `k`-nearest query. Should return at least `k`
    /// ids when the corpus has that many.
    fn candidates(&self, query: &[f32], k: usize) -> Vec<Uuid>;

    fn is_trained(&self) -> bool;

    /// Corpus size at the last training run.
    fn trained_on(&self) -> usize;

    /// Below this corpus size the index answers approximate queries exactly.
    fn min_training_size(&self) -> usize;

    /// Number of partitions, cells, or equivalent units. Informational.
    fn partitions(&self) -> usize;
}

/// Tuning knobs for [`IvfIndex`].
#[derive(Debug, Clone)]
pub struct IvfParams {
    /// Fixed partition count. `None` picks `ceil(sqrt(n))` at training time.
    pub partitions: Option<usize>,
    /// Partitions probed per query.
    pub probes: usize,
    /// Maximum Lloyd iterations.
    pub iterations: usize,
    pub min_training_size: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            partitions: None,
            probes: 8,
            iterations: 10,
            min_training_size: 256,
        }
    }
}

/// k-means partitioned index with multi-probe search.
#[derive(Debug)]
pub struct IvfIndex {
    params: IvfParams,
    metric: DistanceMetric,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<Uuid>>,
    assignment: HashMap<Uuid, usize>,
    trained_on: usize,
}

impl IvfIndex {
    pub fn new(metric: DistanceMetric, params: IvfParams) -> Self {
        Self {
            params,
            metric,
            centroids: Vec::new(),
            lists: Vec::new(),
            assignment: HashMap::new(),
            trained_on: 0,
        }
    }

    fn nearest_centroid(&self, vector: &[f32]) -> usize {
        nearest(self.metric, &self.centroids, vector)
    }

    /// Partition sizes, for diagnostics and tests.
    pub fn partition_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(Vec::len).collect()
    }
}

impl ApproximateIndex for IvfIndex {
    fn name(&self) -> &'static str {
        "ivf"
    }

    fn train(&mut self, vectors: &HashMap<Uuid, Vec<f32>>) {
        self.reset();
        let n = vectors.len();
        if n == 0 {
            return;
        }

        // Sorted ids make initialization and results reproducible.
        let mut ids: Vec<Uuid> = vectors.keys().copied().collect();
        ids.sort_unstable();

        let nlist = self
            .params
            .partitions
            .unwrap_or_else(|| (n as f64).sqrt().ceil() as usize)
            .clamp(1, n);

        let mut centroids = farthest_point_seeds(self.metric, &ids, vectors, nlist);
        let dim = centroids[0].len();

        let mut labels = vec![usize::MAX; n];
        let mut iterations_run = 0;
        for _ in 0..self.params.iterations.max(1) {
            iterations_run += 1;
            let mut changed = false;
            for (slot, id) in ids.iter().enumerate() {
                let best = nearest(self.metric, &centroids, &vectors[id]);
                if labels[slot] != best {
                    labels[slot] = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f64; dim]; nlist];
            let mut counts = vec![0usize; nlist];
            for (slot, id) in ids.iter().enumerate() {
                let c = labels[slot];
                counts[c] += 1;
                for (acc, v) in sums[c].iter_mut().zip(vectors[id].iter()) {
                    *acc += *v as f64;
                }
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                // An empty partition keeps its previous centroid.
                if counts[c] == 0 {
                    continue;
                }
                for (dst, sum) in centroid.iter_mut().zip(sums[c].iter()) {
                    *dst = (*sum / counts[c] as f64) as f32;
                }
            }
        }

        // Final assignment against the settled centroids, so every vector
        // lives in the partition a query for it probes first.
        let mut lists = vec![Vec::new(); nlist];
        for id in ids.iter() {
            let c = nearest(self.metric, &centroids, &vectors[id]);
            lists[c].push(*id);
            self.assignment.insert(*id, c);
        }

        self.centroids = centroids;
        self.lists = lists;
        self.trained_on = n;
        debug!(
            vectors = n,
            partitions = nlist,
            iterations = iterations_run,
            "IVF index trained"
        );
    }

    fn insert(&mut self, id: Uuid, vector: &[f32]) {
        if self.centroids.is_empty() {
            return;
        }
        self.remove(id);
        let c = self.nearest_centroid(vector);
        self.lists[c].push(id);
        self.assignment.insert(id, c);
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(c) = self.assignment.remove(&id) {
            if let Some(list) = self.lists.get_mut(c) {
                list.retain(|member| *member != id);
            }
        }
    }

    fn reset(&mut self) {
        self.centroids.clear();
        self.lists.clear();
        self.assignment.clear();
        self.trained_on = 0;
    }

    fn candidates(&self, query: &[f32], k: usize) -> Vec<Uuid> {
        if self.centroids.is_empty() {
            return Vec::new();
        }
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, distance(self.metric, query, centroid)))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        // Probe at least `probes` partitions, and keep going until k
        // candidates are collected.
        let probes = self.params.probes.max(1);
        let mut out = Vec::new();
        for (probed, (c, _)) in order.iter().enumerate() {
            if probed >= probes && out.len() >= k {
                break;
            }
            out.extend_from_slice(&self.lists[*c]);
        }
        out
    }

    fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    fn trained_on(&self) -> usize {
        self.trained_on
    }

    fn min_training_size(&self) -> usize {
        self.params.min_training_size
    }

    fn partitions(&self) -> usize {
        self.centroids.len()
    }
}

/// Deterministic seeding: start from the first id, then repeatedly take the
/// vector farthest from every seed chosen so far.
fn farthest_point_seeds(
    metric: DistanceMetric,
    ids: &[Uuid],
    vectors: &HashMap<Uuid, Vec<f32>>,
    nlist: usize,
) -> Vec<Vec<f32>> {
    let mut seeds = vec![vectors[&ids[0]].clone()];
    let mut closest: Vec<f32> = ids
        .iter()
        .map(|id| distance(metric, &vectors[id], &seeds[0]))
        .collect();

    while seeds.len() < nlist {
        let mut pick = 0;
        for (slot, d) in closest.iter().enumerate() {
            if *d > closest[pick] {
                pick = slot;
            }
        }
        let seed = vectors[&ids[pick]].clone();
        for (slot, id) in ids.iter().enumerate() {
            let d = distance(metric, &vectors[id], &seed);
            if d < closest[slot] {
                closest[slot] = d;
            }
        }
        seeds.push(seed);
    }
    seeds
}

fn nearest(metric: DistanceMetric, centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = distance(metric, vector, centroid);
        if d < best_dist {
            best = c;
            best_dist = d;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well separated blobs in 2-D.
    fn blobs(per_blob: usize) -> HashMap<Uuid, Vec<f32>> {
        let mut map = HashMap::new();
        for i in 0..per_blob {
            let jitter = i as f32 * 0.001;
            map.insert(Uuid::new_v4(), vec![10.0 + jitter, 10.0 - jitter]);
            map.insert(Uuid::new_v4(), vec![-10.0 - jitter, -10.0 + jitter]);
        }
        map
    }

    fn params(partitions: usize, probes: usize) -> IvfParams {
        IvfParams {
            partitions: Some(partitions),
            probes,
            iterations: 10,
            min_training_size: 1,
        }
    }

    #[test]
    fn test_train_assigns_every_vector() {
        let data = blobs(20);
        let mut ivf = IvfIndex::new(DistanceMetric::L2, params(4, 1));
        ivf.train(&data);
        assert!(ivf.is_trained());
        assert_eq!(ivf.trained_on(), 40);
        assert_eq!(ivf.partition_sizes().iter().sum::<usize>(), 40);
    }

    #[test]
    fn test_default_partition_count_is_sqrt() {
        let data = blobs(50);
        let mut ivf = IvfIndex::new(DistanceMetric::L2, IvfParams::default());
        ivf.train(&data);
        assert_eq!(ivf.partitions(), 10);
    }

    #[test]
    fn test_single_probe_stays_in_blob() {
        let data = blobs(20);
        let mut ivf = IvfIndex::new(DistanceMetric::L2, params(2, 1));
        ivf.train(&data);
        let candidates = ivf.candidates(&[9.0, 9.0], 5);
        assert_eq!(candidates.len(), 20);
        for id in candidates {
            assert!(data[&id][0] > 0.0);
        }
    }

    #[test]
    fn test_probes_expand_until_k() {
        let data = blobs(3);
        let mut ivf = IvfIndex::new(DistanceMetric::L2, params(2, 1));
        ivf.train(&data);
        let candidates = ivf.candidates(&[9.0, 9.0], 5);
        assert_eq!(candidates.len(), 6);
    }

    #[test]
    fn test_insert_and_remove_after_training() {
        let data = blobs(10);
        let mut ivf = IvfIndex::new(DistanceMetric::L2, params(2, 1));
        ivf.train(&data);

        let id = Uuid::new_v4();
        ivf.insert(id, &[-9.5, -9.5]);
        assert!(ivf.candidates(&[-10.0, -10.0], 1).contains(&id));

        // Re-inserting moves the id rather than duplicating it.
        ivf.insert(id, &[9.5, 9.5]);
        assert!(!ivf.candidates(&[-10.0, -10.0], 1).contains(&id));
        assert_eq!(ivf.partition_sizes().iter().sum::<usize>(), 21);

        ivf.remove(id);
        assert_eq!(ivf.partition_sizes().iter().sum::<usize>(), 20);
    }

    #[test]
    fn test_untrained_returns_nothing() {
        let mut ivf = IvfIndex::new(DistanceMetric::Cosine, IvfParams::default());
        ivf.insert(Uuid::new_v4(), &[1.0, 0.0]);
        assert!(ivf.candidates(&[1.0, 0.0], 3).is_empty());
        assert!(!ivf.is_trained());
    }
}
