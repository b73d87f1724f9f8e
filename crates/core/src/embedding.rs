//! Embedder trait: the abstraction over the sentence-embedding model.
//!
//! Claim validation compares claim embeddings with context-page embeddings,
//! so implementations must be deterministic: identical input, identical vector.

use async_trait::async_trait;

use crate::error::ProviderError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// A human-readable name for this embedder.
    fn name(&self) -> &str;

    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts. The output has one vector per input, in order.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Embed a single text.
    async fn encode(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut out = self.encode_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| ProviderError::MalformedResponse("embedder returned no vectors".into()))
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the vectors differ in length, are empty, or either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn cosine_known_value() {
        // [0.4, 0.9165] is a unit vector at cosine 0.4 from [1, 0]
        let sim = cosine_similarity(&[0.4, 0.916_515], &[1.0, 0.0]);
        assert!((sim - 0.4).abs() < 0.001);
    }
}
