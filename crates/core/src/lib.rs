//! # coursegen Core
//!
//! Domain types, collaborator traits, and error definitions for the coursegen
//! content pipeline. This crate has **zero framework dependencies**: it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM engine, embedding model, literature corpus)
//! is defined as a trait here. Implementations live in their respective crates.
//! This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod artifact;
pub mod corpus;
pub mod curriculum;
pub mod embedding;
pub mod error;
pub mod message;
pub mod page;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use artifact::{
    Citation, Claim, ContentArtifact, PageRef, QualityFlag, RelevanceVerdict, RunStage,
    StageTiming, ValidationVerdict, VerdictMethod,
};
pub use corpus::{LiteratureCorpus, Page, TocEntry};
pub use curriculum::{AcademicDegree, CurriculumMetadata, SourceCandidate, Topic};
pub use embedding::{Embedder, cosine_similarity};
pub use error::{CorpusError, FailureReason, ProviderError, RunFailure};
pub use message::{Message, Role};
pub use page::{ContextPage, GenerationContext, PageContent, PageRange, RelevanceSignal};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
