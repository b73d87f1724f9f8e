//! Configuration loading, validation, and management for coursegen.
//!
//! Loads configuration from `~/.coursegen/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.coursegen/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Inference engine connection
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Embedding model selection
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Pipeline thresholds and budgets
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Stage and run deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Result cache sizing and lifetimes
    #[serde(default)]
    pub cache: CacheConfig,

    /// Concurrency limits
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// ── Provider ──────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// OpenAI-compatible base URL (Ollama, vLLM, OpenAI, OpenRouter)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// HTTP client timeout for a single request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Secondary endpoints tried in order when the primary fails
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<FallbackEndpoint>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FallbackEndpoint {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_name() -> String {
    "ollama".into()
}
fn default_base_url() -> String {
    "http://localhost:11434/v1".into()
}
fn default_model() -> String {
    "llama3.1:8b".into()
}
fn default_embedding_model() -> String {
    "paraphrase-multilingual-MiniLM-L12-v2".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            fallbacks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl std::fmt::Debug for FallbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackEndpoint")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// ── Embedding ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// The provider's `/embeddings` endpoint
    Provider,
    /// Local feature-hashing embedder (offline, deterministic)
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: EmbeddingBackend,

    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Provider
}
fn default_embedding_dimensions() -> usize {
    384
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            dimensions: default_embedding_dimensions(),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Token budget of the generation context
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    #[serde(default = "default_pages_per_source_cap")]
    pub pages_per_source_cap: usize,

    /// Maximum number of sources accepted per run
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,

    /// Sources must score strictly above this to be accepted
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Lexical-match confidence above which no LLM judgment is requested
    #[serde(default = "default_algorithmic_confidence")]
    pub algorithmic_confidence: f32,

    /// Placeholder score for sources the LLM could not judge
    #[serde(default = "default_ambiguous_score")]
    pub ambiguous_score: f32,

    #[serde(default = "default_keyword_density_threshold")]
    pub keyword_density_threshold: f32,

    /// Minimum claim/page similarity for a claim to count as supported
    #[serde(default = "default_support_threshold")]
    pub support_threshold: f32,

    /// Artifacts with mean confidence below this require manual review
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f32,

    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,

    /// Bounded channel capacity between generation and validation
    #[serde(default = "default_chunk_channel_capacity")]
    pub chunk_channel_capacity: usize,
}

fn default_max_context_tokens() -> usize {
    5000
}
fn default_pages_per_source_cap() -> usize {
    15
}
fn default_max_sources() -> usize {
    3
}
fn default_relevance_threshold() -> f32 {
    0.7
}
fn default_algorithmic_confidence() -> f32 {
    0.8
}
fn default_ambiguous_score() -> f32 {
    0.5
}
fn default_keyword_density_threshold() -> f32 {
    0.02
}
fn default_support_threshold() -> f32 {
    0.7
}
fn default_review_threshold() -> f32 {
    0.7
}
fn default_claim_batch_size() -> usize {
    16
}
fn default_chunk_channel_capacity() -> usize {
    32
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            pages_per_source_cap: default_pages_per_source_cap(),
            max_sources: default_max_sources(),
            relevance_threshold: default_relevance_threshold(),
            algorithmic_confidence: default_algorithmic_confidence(),
            ambiguous_score: default_ambiguous_score(),
            keyword_density_threshold: default_keyword_density_threshold(),
            support_threshold: default_support_threshold(),
            review_threshold: default_review_threshold(),
            claim_batch_size: default_claim_batch_size(),
            chunk_channel_capacity: default_chunk_channel_capacity(),
        }
    }
}

// ── Timeouts ──────────────────────────────────────────────────────────────

/// Deadlines in seconds. Serialized as plain integers for readable TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_relevance_secs")]
    pub relevance: u64,
    #[serde(default = "default_selection_secs")]
    pub selection: u64,
    #[serde(default = "default_per_source_secs")]
    pub per_source: u64,
    #[serde(default = "default_generation_secs")]
    pub generation: u64,
    #[serde(default = "default_validation_secs")]
    pub validation: u64,
    #[serde(default = "default_formatting_secs")]
    pub formatting: u64,
    /// Whole-run deadline
    #[serde(default = "default_run_secs")]
    pub run: u64,
}

fn default_relevance_secs() -> u64 {
    30
}
fn default_selection_secs() -> u64 {
    60
}
fn default_per_source_secs() -> u64 {
    20
}
fn default_generation_secs() -> u64 {
    180
}
fn default_validation_secs() -> u64 {
    60
}
fn default_formatting_secs() -> u64 {
    5
}
fn default_run_secs() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            relevance: default_relevance_secs(),
            selection: default_selection_secs(),
            per_source: default_per_source_secs(),
            generation: default_generation_secs(),
            validation: default_validation_secs(),
            formatting: default_formatting_secs(),
            run: default_run_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn relevance(&self) -> Duration {
        Duration::from_secs(self.relevance)
    }
    pub fn selection(&self) -> Duration {
        Duration::from_secs(self.selection)
    }
    pub fn per_source(&self) -> Duration {
        Duration::from_secs(self.per_source)
    }
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation)
    }
    pub fn validation(&self) -> Duration {
        Duration::from_secs(self.validation)
    }
    pub fn formatting(&self) -> Duration {
        Duration::from_secs(self.formatting)
    }
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run)
    }
}

// ── Cache / runtime / logging ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Templates change rarely and get a longer lifetime
    #[serde(default = "default_template_ttl_secs")]
    pub template_ttl_secs: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_template_ttl_secs() -> u64 {
    86_400
}
fn default_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            template_ttl_secs: default_template_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn template_ttl(&self) -> Duration {
        Duration::from_secs(self.template_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pipeline runs allowed to execute at once
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Page-loading tasks allowed per run at once
    #[serde(default = "default_max_parallel_sources")]
    pub max_parallel_sources: usize,
}

fn default_max_concurrent_runs() -> usize {
    10
}
fn default_max_parallel_sources() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            max_parallel_sources: default_max_parallel_sources(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.coursegen/config.toml).
    ///
    /// Environment variables override file values:
    /// - `COURSEGEN_API_KEY`
    /// - `COURSEGEN_BASE_URL`
    /// - `COURSEGEN_MODEL`
    /// - `COURSEGEN_EMBEDDING_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("COURSEGEN_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("COURSEGEN_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("COURSEGEN_MODEL") {
            self.provider.model = model;
        }
        if let Ok(model) = std::env::var("COURSEGEN_EMBEDDING_MODEL") {
            self.provider.embedding_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".coursegen")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;

        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        for (name, value) in [
            ("relevance_threshold", p.relevance_threshold),
            ("algorithmic_confidence", p.algorithmic_confidence),
            ("ambiguous_score", p.ambiguous_score),
            ("keyword_density_threshold", p.keyword_density_threshold),
            ("support_threshold", p.support_threshold),
            ("review_threshold", p.review_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "pipeline.{name} must be between 0.0 and 1.0"
                )));
            }
        }

        for (name, value) in [
            ("max_context_tokens", p.max_context_tokens),
            ("pages_per_source_cap", p.pages_per_source_cap),
            ("max_sources", p.max_sources),
            ("claim_batch_size", p.claim_batch_size),
            ("chunk_channel_capacity", p.chunk_channel_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pipeline.{name} must be > 0"
                )));
            }
        }

        let t = &self.timeouts;
        if [
            t.relevance,
            t.selection,
            t.per_source,
            t.generation,
            t.validation,
            t.formatting,
            t.run,
        ]
        .contains(&0)
        {
            return Err(ConfigError::ValidationError(
                "all timeouts must be > 0 seconds".into(),
            ));
        }

        if t.per_source > t.selection {
            return Err(ConfigError::ValidationError(
                "timeouts.per_source must not exceed timeouts.selection".into(),
            ));
        }

        if self.runtime.max_concurrent_runs == 0 || self.runtime.max_parallel_sources == 0 {
            return Err(ConfigError::ValidationError(
                "runtime limits must be > 0".into(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
