//! Embedding service contract.
//!
//! The engine never ships a model; callers inject an implementation at
//! construction. Vectors must have the repository's configured dimension
//! and be suitable for cosine similarity.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Dimensionality of every vector this service produces.
    fn dimension(&self) -> usize;

    async fn generate(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch generation; the default maps over [`generate`](Self::generate)
    /// sequentially, implementations with a real batch endpoint override
    /// it.
    async fn generate_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.generate(text).await?);
        }
        Ok(vectors)
    }
}
