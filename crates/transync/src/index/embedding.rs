use async_trait::async_trait;

use super::EmbeddingClient;
use crate::error::EmbeddingError;

/// Deterministic local embedding client.
///
/// Hashes bytes into a fixed number of slots and L2-normalizes the result.
/// Useful offline and in tests; swap for a real provider in production.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            embedding[idx % self.dimension] += f32::from(byte) / 255.0;
        }

        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn request_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.dimension == 0 {
            return Err(EmbeddingError::Unavailable(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        tracing::debug!(count = texts.len(), dimension = self.dimension, "Generating embeddings");
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}
