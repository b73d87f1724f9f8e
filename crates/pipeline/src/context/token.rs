//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 bytes per token. This is what the
//! context budget is enforced against, so it must be the only estimator the
//! builder uses.

use coursegen_core::PageContent;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 bytes. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Tokens for a page as it appears in the prompt (marker header plus text).
pub fn estimate_page_tokens(page: &PageContent) -> usize {
    estimate_tokens(&page.render_block())
}

/// Largest byte length whose estimate fits in `tokens`.
pub fn bytes_for_tokens(tokens: usize) -> usize {
    tokens.saturating_mul(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_core::{PageRange, RelevanceSignal};

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn cyrillic_counts_bytes() {
        // 8 chars, 16 bytes
        assert_eq!(estimate_tokens("энтропия"), 4);
    }

    #[test]
    fn page_includes_header() {
        let page = PageContent {
            source_id: "b1".into(),
            source_title: "T".into(),
            range: PageRange::single(1),
            text: "abcd".into(),
            signal: RelevanceSignal {
                toc_match: None,
                keyword_density: None,
                composite: 0.0,
            },
            source_rank: 0,
        };
        // "[src:b1, p.1] T\nabcd" is 20 bytes
        assert_eq!(estimate_page_tokens(&page), 5);
    }

    #[test]
    fn byte_budget_roundtrips() {
        let text = "a".repeat(bytes_for_tokens(7));
        assert_eq!(estimate_tokens(&text), 7);
    }
}
