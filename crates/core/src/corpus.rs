//! LiteratureCorpus trait: read-only access to the backing book corpus.
//!
//! The pipeline never writes to the corpus. Lookups that fail for a single
//! source are absorbed by the page selector; an unreachable corpus surfaces
//! as `DependencyUnavailable` only when no source could be loaded at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::curriculum::SourceCandidate;
use crate::error::CorpusError;

/// One page of a source's full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    pub text: String,
}

/// One table-of-contents section with its inclusive page range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
}

#[async_trait]
pub trait LiteratureCorpus: Send + Sync {
    /// A human-readable name for this corpus.
    fn name(&self) -> &str;

    /// Resolve a bibliographic reference to a corpus source.
    async fn search(
        &self,
        title: &str,
        authors: &str,
    ) -> Result<Option<SourceCandidate>, CorpusError>;

    /// All pages of a source, in page order.
    async fn get_full_text(&self, source_id: &str) -> Result<Vec<Page>, CorpusError>;

    /// The source's table of contents, in document order.
    async fn get_table_of_contents(&self, source_id: &str) -> Result<Vec<TocEntry>, CorpusError>;
}
