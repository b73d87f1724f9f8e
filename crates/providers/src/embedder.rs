//! Sentence embedders.
//!
//! [`ProviderEmbedder`] delegates to an inference endpoint's `/embeddings`
//! route. [`HashingEmbedder`] is an offline, dependency-free fallback that
//! projects word and character-trigram features into a fixed-size vector.

use async_trait::async_trait;
use coursegen_core::error::ProviderError;
use coursegen_core::provider::{EmbeddingRequest, Provider};
use coursegen_core::Embedder;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Embeds through a [`Provider`]'s embedding endpoint.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    dimensions: usize,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, count = texts.len(), "Encoding batch");
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: texts.to_vec(),
            })
            .await?;

        if response.embeddings.len() != texts.len() {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase word and each character trigram of each word is hashed to a
/// bucket with a sign bit; the result is L2-normalized. Texts sharing
/// vocabulary land close together, which is enough for offline runs and tests.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            self.add_feature(&mut vector, &word, 1.0);

            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add_feature(&mut vector, &gram, 0.5);
                }
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dimensions;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_core::cosine_similarity;
    use coursegen_core::provider::{EmbeddingResponse, ProviderRequest, ProviderResponse};
    use std::sync::Mutex;

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed_text("Entropy of an ideal gas");
        let b = e.embed_text("Entropy of an ideal gas");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let claim = e.embed_text("The entropy of an isolated system never decreases");
        let related = e.embed_text("In an isolated system entropy never decreases over time");
        let unrelated = e.embed_text("Binary search trees support logarithmic lookup");
        assert!(cosine_similarity(&claim, &related) > cosine_similarity(&claim, &unrelated));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(16).embed_text("  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    struct CountingEmbedProvider {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Provider for CountingEmbedProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, _r: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("no chat".into()))
        }

        async fn embed(&self, r: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            Ok(EmbeddingResponse {
                embeddings: r.inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                model: r.model,
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn provider_embedder_batches_one_call() {
        let provider = Arc::new(CountingEmbedProvider {
            calls: Mutex::new(0),
        });
        let embedder = ProviderEmbedder::new(provider.clone(), "mini", 2);
        let out = embedder
            .encode_batch(&["a".into(), "bbb".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![3.0, 1.0]]);
        assert_eq!(*provider.calls.lock().unwrap(), 1);

        assert!(embedder.encode_batch(&[]).await.unwrap().is_empty());
        assert_eq!(*provider.calls.lock().unwrap(), 1);
    }
}
