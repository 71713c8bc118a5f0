//! Embedding providers: the async contract, a deterministic mock, and the
//! HTTP client implementation.

pub mod http;

pub use http::{EmbeddingConfig, HttpEmbeddingClient};

use async_trait::async_trait;

use crate::types::TreedexError;

/// Converts text into vectors.
///
/// Implementations are shared across stores and the search orchestrator via
/// `Arc<dyn EmbeddingProvider>`. Batch calls preserve input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TreedexError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TreedexError>;

    /// Short identifier for telemetry (model name or provider label).
    fn name(&self) -> &str;
}

/// Deterministic embedding provider for tests and offline runs.
///
/// Vectors are derived from an FNV-1a hash of the input text, so identical
/// texts always map to identical unit-length vectors and different texts
/// almost always differ.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dim: usize,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self { dim: 16 }
    }

    #[must_use]
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }

        let mut vector = Vec::with_capacity(self.dim);
        let mut state = hash;
        for _ in 0..self.dim {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
            vector.push((unit * 2.0 - 1.0) as f32);
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, TreedexError> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TreedexError> {
        Ok(texts.iter().map(|text| self.vector_for(text)).collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let provider = MockEmbeddingProvider::new();
        let texts = vec!["hello".to_string(), "world".to_string(), "hello".to_string()];

        let first = provider.embed_batch(&texts).await.unwrap();
        let second = provider.embed_batch(&texts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
    }

    #[tokio::test]
    async fn mock_embeddings_are_unit_length() {
        let provider = MockEmbeddingProvider::new().with_dim(32);
        let vector = provider.embed("normalize me").await.unwrap();
        assert_eq!(vector.len(), 32);
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
