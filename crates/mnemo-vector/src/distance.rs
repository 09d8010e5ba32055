//! Distance functions. All return "smaller is closer".

use mnemo_core::types::DistanceMetric;

/// Distance between `a` and `b` under `metric`.
///
/// Callers guarantee equal lengths; the index validates dimensions on the
/// way in.
#[inline]
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => cosine_distance(a, b),
        DistanceMetric::L2 => l2_distance(a, b),
    }
}

/// `1 - cosine_similarity`. A zero-magnitude vector is maximally
/// dissimilar to everything (distance 1.0).
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }
    let sim = (dot / (mag_a.sqrt() * mag_b.sqrt())).clamp(-1.0, 1.0);
    (1.0 - sim) as f32
}

/// Euclidean distance.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}
