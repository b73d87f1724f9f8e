//! Lexical helpers shared by the relevance matcher and the page selector.
//!
//! Matching is stem-tolerant: Russian and English inflections share a long
//! common prefix, so two tokens whose prefix covers all but the last few
//! characters of the shorter one are treated as the same word.

use std::collections::HashSet;
use std::sync::OnceLock;

/// Shortest common prefix that counts as a stem match.
const MIN_STEM: usize = 4;

/// Characters an inflected ending may differ by.
const MAX_ENDING: usize = 3;

/// Similarity assigned to two inflections of the same stem.
pub const STEM_SIMILARITY: f32 = 0.95;

fn stopwords() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        [
            "the", "of", "and", "in", "on", "for", "to", "a", "an", "with", "by", "at", "from",
            "into", "its", "is", "are", "и", "в", "во", "на", "по", "для", "с", "со", "о", "об",
            "к", "из", "от", "до", "при", "как", "или", "что", "это",
        ]
        .into_iter()
        .collect()
    })
}

/// Lowercase alphanumeric words, stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1 && !stopwords().contains(w.as_str()))
        .collect()
}

fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Whether two tokens are inflections of the same word.
pub fn stems_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let prefix = common_prefix_chars(a, b);
    let shorter = a.chars().count().min(b.chars().count());
    prefix >= MIN_STEM && prefix + MAX_ENDING >= shorter
}

/// Similarity of two tokens in [0, 1].
///
/// Exact match is 1.0, a stem match is [`STEM_SIMILARITY`], a shared prefix of
/// at least four characters earns partial credit, anything else is 0.
pub fn token_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    if stems_match(a, b) {
        return STEM_SIMILARITY;
    }
    let prefix = common_prefix_chars(a, b);
    if prefix < MIN_STEM {
        return 0.0;
    }
    let longer = a.chars().count().max(b.chars().count());
    prefix as f32 / longer as f32
}

/// Mean, over query tokens, of the best similarity against any target token.
pub fn match_score(query: &[String], target: &[String]) -> f32 {
    if query.is_empty() || target.is_empty() {
        return 0.0;
    }
    let total: f32 = query
        .iter()
        .map(|q| {
            target
                .iter()
                .map(|t| token_similarity(q, t))
                .fold(0.0f32, f32::max)
        })
        .sum();
    total / query.len() as f32
}

/// Truncate to at most `max_bytes`, on a char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
