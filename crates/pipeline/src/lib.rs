//! # coursegen Pipeline
//!
//! The content generation stages and the coordinator that runs them:
//!
//! - [`relevance`]: lexical match first, one batched LLM judgment for the rest
//! - [`selection`]: concurrent per-source page loading and ranking
//! - [`context`]: token-budgeted generation context
//! - [`generation`]: streamed lecture generation
//! - [`validation`]: embedding-based claim checking, no inference
//! - [`template`]: discipline templates
//! - [`coordinator`]: the per-run state machine

pub mod context;
pub mod coordinator;
pub mod generation;
pub mod relevance;
pub mod selection;
pub mod template;
pub mod text;
pub mod validation;

#[cfg(test)]
mod test_helpers;

pub use context::ContextBuilder;
pub use coordinator::{BatchReport, BatchSummary, PipelineCoordinator, RunRequest};
pub use generation::{ContentGenerator, TemplateSpec};
pub use relevance::{RelevanceEvaluator, RelevanceReport, RelevanceSettings};
pub use selection::{PageSelector, SelectionOutcome, SelectionSettings};
pub use template::{TemplateFormatter, TemplateRegistry};
pub use validation::{ClaimValidator, ValidationOutcome};
