use coursegen_core::{ContextPage, GenerationContext, PageContent};
use tracing::{debug, warn};

use super::token::{bytes_for_tokens, estimate_page_tokens};
use crate::text::truncate_bytes;

/// Order pages for context admission: composite score descending, then
/// source acceptance rank, then page number.
pub fn rank(pages: &mut [PageContent]) {
    pages.sort_by(|a, b| {
        b.signal
            .composite
            .total_cmp(&a.signal.composite)
            .then(a.source_rank.cmp(&b.source_rank))
            .then(a.range.start.cmp(&b.range.start))
    });
}

/// Builds immutable, budget-bounded generation contexts. Stateless.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    max_tokens: usize,
}

impl ContextBuilder {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Accept pages greedily in rank order until the next one would exceed
    /// the budget.
    ///
    /// If not even the top page fits, it is truncated to the budget so the
    /// context is never empty while at least one page was selected.
    pub fn build(&self, mut pages: Vec<PageContent>) -> GenerationContext {
        rank(&mut pages);
        let selected = pages.len();

        let mut accepted: Vec<ContextPage> = Vec::new();
        let mut used = 0usize;
        for page in pages.iter() {
            let tokens = estimate_page_tokens(page);
            if used + tokens > self.max_tokens {
                break;
            }
            used += tokens;
            accepted.push(ContextPage {
                page: page.clone(),
                tokens,
            });
        }

        if accepted.is_empty()
            && let Some(top) = pages.into_iter().next()
        {
            match fit_page(top, self.max_tokens) {
                Some(fitted) => {
                    debug!(tokens = fitted.tokens, "Top page truncated to fit context budget");
                    accepted.push(fitted);
                }
                None => warn!(
                    max_tokens = self.max_tokens,
                    "Context budget too small for a single page header"
                ),
            }
        }

        let dropped = selected - accepted.len();
        debug!(
            pages = accepted.len(),
            dropped,
            max_tokens = self.max_tokens,
            "Generation context built"
        );
        self.finish(accepted, dropped)
    }

    /// A smaller context for a generation retry: the lower-ranked half of
    /// the pages is dropped (at least one). A single page is cut to half its
    /// length instead.
    pub fn shortened(&self, context: &GenerationContext) -> GenerationContext {
        let pages = context.pages();
        match pages.len() {
            0 => context.clone(),
            1 => {
                let only = &pages[0];
                match fit_page(only.page.clone(), only.tokens / 2) {
                    Some(half) if half.tokens < only.tokens => {
                        self.finish(vec![half], context.dropped_pages())
                    }
                    _ => context.clone(),
                }
            }
            n => {
                let drop = (n / 2).max(1);
                let kept = pages[..n - drop].to_vec();
                self.finish(kept, context.dropped_pages() + drop)
            }
        }
    }

    fn finish(&self, pages: Vec<ContextPage>, dropped: usize) -> GenerationContext {
        GenerationContext::new(pages, self.max_tokens, dropped).unwrap_or_else(|| {
            warn!("Context exceeded its budget after assembly, discarding pages");
            GenerationContext::empty(self.max_tokens)
        })
    }
}

/// Truncate a page's text (and if necessary drop its title) so its rendered
/// block fits in `max_tokens`.
fn fit_page(mut page: PageContent, max_tokens: usize) -> Option<ContextPage> {
    let budget = bytes_for_tokens(max_tokens);
    let mut header = page.render_block().len() - page.text.len();
    if header > budget {
        page.source_title.clear();
        header = page.render_block().len() - page.text.len();
        if header > budget {
            return None;
        }
    }
    page.text = truncate_bytes(&page.text, budget - header).to_string();
    let tokens = estimate_page_tokens(&page);
    Some(ContextPage { page, tokens })
}
