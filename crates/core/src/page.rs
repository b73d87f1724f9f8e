//! Selected source pages and the token-bounded generation context built from them.

use serde::{Deserialize, Serialize};

/// Inclusive page range within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn single(page: u32) -> Self {
        Self {
            start: page,
            end: page,
        }
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Why a page was selected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceSignal {
    /// Match score of the table-of-contents section containing the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc_match: Option<f32>,
    /// Fraction of page tokens that match a topic keyword.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_density: Option<f32>,
    /// Weighted combination used for ranking.
    pub composite: f32,
}

/// A page (or page range) loaded from a source for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub source_id: String,
    pub source_title: String,
    pub range: PageRange,
    pub text: String,
    pub signal: RelevanceSignal,
    /// Position of the owning source in the relevance ranking (0 = best).
    pub source_rank: usize,
}

impl PageContent {
    /// The inline citation marker the generator must attach to claims drawn from this page.
    pub fn marker(&self) -> String {
        format!("[src:{}, p.{}]", self.source_id, self.range)
    }

    /// The page as it appears inside the generation prompt.
    pub fn render_block(&self) -> String {
        format!("{} {}\n{}", self.marker(), self.source_title, self.text)
    }
}

/// A page admitted into the generation context, with its estimated token cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPage {
    pub page: PageContent,
    pub tokens: usize,
}

/// An ordered, token-bounded sequence of pages. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationContext {
    pages: Vec<ContextPage>,
    total_tokens: usize,
    max_tokens: usize,
    dropped_pages: usize,
}

impl GenerationContext {
    /// Build a context from already-budgeted pages.
    ///
    /// Returns `None` if the pages exceed `max_tokens`.
    pub fn new(pages: Vec<ContextPage>, max_tokens: usize, dropped_pages: usize) -> Option<Self> {
        let total_tokens: usize = pages.iter().map(|p| p.tokens).sum();
        if total_tokens > max_tokens {
            return None;
        }
        Some(Self {
            pages,
            total_tokens,
            max_tokens,
            dropped_pages,
        })
    }

    /// A context with no pages.
    pub fn empty(max_tokens: usize) -> Self {
        Self {
            pages: Vec::new(),
            total_tokens: 0,
            max_tokens,
            dropped_pages: 0,
        }
    }

    pub fn pages(&self) -> &[ContextPage] {
        &self.pages
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Selected pages that did not fit the budget.
    pub fn dropped_pages(&self) -> usize {
        self.dropped_pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// All page blocks joined for the prompt, in rank order.
    pub fn render(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.page.render_block())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
