//! Embedding service trait and implementations.
//!
//! The engine never computes embeddings itself. Callers hand it an
//! [`EmbeddingService`]; [`FnEmbedding`] adapts a plain `text -> vector`
//! function.

use mnemo_core::error::Result;

/// Turns text into fixed-dimensional vectors for ingestion and query.
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> impl std::future::Future<Output = Result<Vec<f32>>> + Send;

    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// FnEmbedding - caller-supplied synchronous function
// ---------------------------------------------------------------------------

/// Wraps a synchronous `text -> vector` function supplied by the caller.
pub struct FnEmbedding<F> {
    func: F,
    dimensions: usize,
}

impl<F> FnEmbedding<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    pub fn new(dimensions: usize, func: F) -> Self {
        Self { func, dimensions }
    }
}

impl<F> EmbeddingService for FnEmbedding<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (self.func)(text)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

impl<F> std::fmt::Debug for FnEmbedding<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnEmbedding")
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockEmbedding;

#[cfg(any(test, feature = "test-util"))]
mod mock {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use mnemo_core::error::{MnemoError, Result};

    use super::EmbeddingService;

    /// Bag-of-words embedding for tests.
    ///
    /// Each lowercased word is hashed to a signed bucket and the counts are
    /// L2-normalized, so texts sharing words land close together and
    /// identical texts produce identical vectors.
    #[derive(Debug, Clone)]
    pub struct MockEmbedding {
        dimensions: usize,
    }

    impl MockEmbedding {
        pub fn new(dimensions: usize) -> Self {
            Self {
                dimensions: dimensions.max(1),
            }
        }

        fn bucket(&self, word: &str) -> (usize, f32) {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let h = hasher.finish();
            let sign = if h & 1 == 0 { 1.0 } else { -1.0 };
            ((h >> 1) as usize % self.dimensions, sign)
        }
    }

    impl EmbeddingService for MockEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; self.dimensions];
            let mut words = 0;
            for word in text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
            {
                let (slot, sign) = self.bucket(&word.to_lowercase());
                vector[slot] += sign;
                words += 1;
            }
            if words == 0 {
                return Err(MnemoError::Embedding(format!(
                    "no words to embed in {text:?}"
                )));
            }

            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm == 0.0 {
                // Every word cancelled out; fall back to a fixed axis.
                vector[0] = 1.0;
            } else {
                vector.iter_mut().for_each(|v| *v /= norm);
            }
            Ok(vector)
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::cosine_distance;

    #[tokio::test]
    async fn test_shared_words_are_closer() {
        let embedder = MockEmbedding::new(64);
        let base = embedder.embed("deploy the cache service").await.unwrap();
        let near = embedder.embed("Deploy the CACHE!").await.unwrap();
        let far = embedder.embed("sourdough rye starter").await.unwrap();
        assert_eq!(base.len(), 64);
        assert!(cosine_distance(&base, &near) < cosine_distance(&base, &far));
    }

    #[tokio::test]
    async fn test_word_order_and_case_ignored() {
        let embedder = MockEmbedding::new(32);
        let a = embedder.embed("memory engine").await.unwrap();
        let b = embedder.embed("Engine, memory.").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_text_without_words_fails() {
        let embedder = MockEmbedding::new(8);
        assert!(embedder.embed("").await.is_err());
        assert!(embedder.embed(" -- ").await.is_err());
    }

    #[tokio::test]
    async fn test_fn_embedding() {
        let service = FnEmbedding::new(2, |text: &str| Ok(vec![text.len() as f32, 1.0]));
        assert_eq!(service.embed("abc").await.unwrap(), vec![3.0, 1.0]);
        assert_eq!(service.dimensions(), 2);
    }
}
