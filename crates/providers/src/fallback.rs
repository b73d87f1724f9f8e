//! Inference engine failover.
//!
//! Endpoints are tried in configured order, each under its own timeout. Only
//! errors that say the endpoint cannot serve right now move on to the next
//! one: unreachable or unconfigured engines, timeouts, rate limits, and 5xx
//! responses. A request the engine understood and rejected (bad key, unknown
//! model, malformed output, 4xx) is returned as is.
//!
//! For streams only the connection phase fails over. Once chunks flow, a
//! mid-stream failure belongs to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coursegen_core::error::ProviderError;
use coursegen_core::provider::{
    ChunkReceiver, EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest,
    ProviderResponse,
};
use tracing::{debug, warn};

/// Whether another endpoint might succeed where this one failed.
pub fn is_retryable_elsewhere(error: &ProviderError) -> bool {
    match error {
        ProviderError::Timeout(_) | ProviderError::RateLimited { .. } => true,
        ProviderError::ApiError { status_code, .. } => *status_code >= 500,
        other => other.is_unavailable(),
    }
}

struct Endpoint {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

/// An ordered chain of inference endpoints presented as one provider.
pub struct FallbackProvider {
    name: String,
    endpoints: Vec<Endpoint>,
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoints: Vec::new(),
        }
    }

    /// Append an endpoint, tried after every endpoint added before it.
    pub fn add(mut self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.endpoints.push(Endpoint { provider, timeout });
        self
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    async fn first_success<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = ProviderError::NotConfigured(format!(
            "no inference endpoints configured for '{}'",
            self.name
        ));

        for (position, endpoint) in self.endpoints.iter().enumerate() {
            let endpoint_name = endpoint.provider.name().to_string();
            debug!(endpoint = %endpoint_name, position, operation, "Calling inference endpoint");

            let error = match tokio::time::timeout(endpoint.timeout, call(endpoint.provider.clone()))
                .await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(format!(
                    "{endpoint_name} {operation} exceeded {}s",
                    endpoint.timeout.as_secs()
                )),
            };

            if !is_retryable_elsewhere(&error) {
                debug!(endpoint = %endpoint_name, operation, error = %error, "Request rejected, not failing over");
                return Err(error);
            }
            warn!(
                endpoint = %endpoint_name,
                operation,
                error = %error,
                remaining = self.endpoints.len() - position - 1,
                "Inference endpoint unavailable, failing over"
            );
            last_error = error;
        }

        Err(last_error)
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.first_success("completion", |provider| {
            let request = request.clone();
            async move { provider.complete(request).await }
        })
        .await
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.first_success("stream", |provider| {
            let request = request.clone();
            async move { provider.stream(request).await }
        })
        .await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        self.first_success("embedding", |provider| {
            let request = request.clone();
            async move { provider.embed(request).await }
        })
        .await
    }

    /// Models served by any endpoint, without duplicates.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let mut models: Vec<String> = Vec::new();
        for endpoint in &self.endpoints {
            match endpoint.provider.list_models().await {
                Ok(listed) => {
                    for model in listed {
                        if !models.contains(&model) {
                            models.push(model);
                        }
                    }
                }
                Err(e) => warn!(endpoint = %endpoint.provider.name(), error = %e, "Could not list models"),
            }
        }
        Ok(models)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        for endpoint in &self.endpoints {
            if let Ok(true) = endpoint.provider.health_check().await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
