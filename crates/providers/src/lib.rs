//! Inference and embedding backends for coursegen.
//!
//! All chat backends implement `coursegen_core::Provider`; embedders
//! implement `coursegen_core::Embedder`. The router builds both from config.

pub mod embedder;
pub mod fallback;
pub mod openai_compat;
pub mod router;

pub use embedder::{HashingEmbedder, ProviderEmbedder};
pub use fallback::FallbackProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use router::{Backends, build_from_config};
