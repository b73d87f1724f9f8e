//! Provider construction from configuration.
//!
//! Builds the inference provider (primary endpoint plus any configured
//! fallbacks) and the sentence embedder the pipeline runs against.

use std::sync::Arc;
use std::time::Duration;

use coursegen_config::{AppConfig, EmbeddingBackend};
use coursegen_core::{Embedder, Provider};
use tracing::info;

use crate::embedder::{HashingEmbedder, ProviderEmbedder};
use crate::fallback::FallbackProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// The backends a pipeline needs, built from one config.
#[derive(Clone)]
pub struct Backends {
    pub provider: Arc<dyn Provider>,
    pub embedder: Arc<dyn Embedder>,
}

/// Build the provider chain and embedder from configuration.
pub fn build_from_config(config: &AppConfig) -> Backends {
    let p = &config.provider;
    let primary = OpenAiCompatProvider::with_timeout(
        &p.name,
        &p.base_url,
        p.api_key.clone().unwrap_or_else(|| default_api_key(&p.name)),
        Duration::from_secs(p.request_timeout_secs),
    )
    .with_chunk_capacity(config.pipeline.chunk_channel_capacity);

    let provider: Arc<dyn Provider> = if p.fallbacks.is_empty() {
        Arc::new(primary)
    } else {
        let mut chain = FallbackProvider::new(format!("{}+fallbacks", p.name)).add(
            Arc::new(primary),
            Duration::from_secs(p.request_timeout_secs),
        );
        for fb in &p.fallbacks {
            let timeout = Duration::from_secs(fb.timeout_secs);
            let endpoint = OpenAiCompatProvider::with_timeout(
                &fb.name,
                &fb.base_url,
                fb.api_key.clone().unwrap_or_else(|| default_api_key(&fb.name)),
                timeout,
            )
            .with_chunk_capacity(config.pipeline.chunk_channel_capacity);
            chain = chain.add(Arc::new(endpoint), timeout);
        }
        info!(endpoints = chain.len(), "Built provider fallback chain");
        Arc::new(chain)
    };

    let embedder: Arc<dyn Embedder> = match config.embedding.backend {
        EmbeddingBackend::Provider => Arc::new(ProviderEmbedder::new(
            provider.clone(),
            &p.embedding_model,
            config.embedding.dimensions,
        )),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(config.embedding.dimensions)),
    };

    info!(
        provider = provider.name(),
        embedder = embedder.name(),
        model = %p.model,
        "Backends ready"
    );

    Backends { provider, embedder }
}

/// Local engines accept any bearer token.
fn default_api_key(provider_name: &str) -> String {
    match provider_name {
        "ollama" | "vllm" | "llamacpp" | "llama.cpp" => provider_name.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_config::FallbackEndpoint;

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let backends = build_from_config(&config);
        assert_eq!(backends.provider.name(), "ollama");
        assert_eq!(backends.embedder.dimensions(), config.embedding.dimensions);
    }

    #[test]
    fn fallbacks_wrap_primary() {
        let mut config = AppConfig::default();
        config.provider.fallbacks.push(FallbackEndpoint {
            name: "vllm".into(),
            base_url: "http://localhost:8000/v1".into(),
            api_key: None,
            timeout_secs: 30,
        });
        let backends = build_from_config(&config);
        assert_eq!(backends.provider.name(), "ollama+fallbacks");
    }

    #[test]
    fn hashing_backend_selected() {
        let mut config = AppConfig::default();
        config.embedding.backend = EmbeddingBackend::Hashing;
        let backends = build_from_config(&config);
        assert_eq!(backends.embedder.name(), "hashing");
    }

    #[test]
    fn local_engines_get_placeholder_key() {
        assert_eq!(default_api_key("ollama"), "ollama");
        assert_eq!(default_api_key("openrouter"), "");
    }
}
