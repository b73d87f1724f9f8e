//! Error types for the coursegen domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Collaborator errors (`ProviderError`, `CorpusError`) stay internal to the
//! stages. Run-level failures are a separate, serializable taxonomy
//! ([`FailureReason`]) surfaced to callers as structured data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::RunStage;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether the backing service is unreachable rather than misbehaving.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::NotConfigured(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum CorpusError {
    #[error("Source not found in corpus: {0}")]
    SourceNotFound(String),

    #[error("Corpus service unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt corpus record for {source_id}: {reason}")]
    Corrupt { source_id: String, reason: String },
}

// --- Run failure taxonomy ---

/// Why a pipeline run ended in the `Failed` state.
///
/// Low-confidence content is deliberately absent: it is a quality flag on a
/// successful artifact (see [`crate::artifact::QualityFlag`]).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("no candidate source scored above the relevance threshold")]
    NoRelevantSource,

    #[error("accepted sources yielded no usable pages")]
    SelectionEmpty,

    #[error("content generation failed after retry: {reason}")]
    GenerationFailed { reason: String },

    #[error("deadline exceeded during {stage} stage")]
    DeadlineExceeded { stage: RunStage },

    #[error("{dependency} unavailable: {reason}")]
    DependencyUnavailable { dependency: String, reason: String },
}

/// A failed run: the stage that was active and the tagged reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("run {run_id} failed in {stage}: {reason}")]
pub struct RunFailure {
    pub run_id: String,
    pub stage: RunStage,
    pub reason: FailureReason,
}

impl RunFailure {
    pub fn new(run_id: impl Into<String>, stage: RunStage, reason: FailureReason) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            reason,
        }
    }
}
