//! Claim validation by embedding similarity.
//!
//! Generated text is cut into sentences as it streams in. Sentences that
//! carry a factual statement become claims; each claim is embedded and
//! compared against every context page. A claim whose best cosine similarity
//! falls below the support threshold is replaced in place by a review marker.
//! This stage never calls the LLM.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use coursegen_config::AppConfig;
use coursegen_core::{
    Citation, Claim, Embedder, GenerationContext, PageRange, PageRef, ProviderError,
    ValidationVerdict, cosine_similarity,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::generation::TextReceiver;

const MARKER_OPEN: &str = "[src:";

/// Prefix of the in-text annotation that replaces an unsupported claim.
pub const REVIEW_OPEN: &str = "[NEEDS REVIEW";

// ── Markers ───────────────────────────────────────────────────────────────

/// Parse the inside of a `[src:<id>, p.<page>]` marker.
fn parse_marker(inner: &str) -> Option<Citation> {
    let (id, page) = inner.split_once(',')?;
    let id = id.trim();
    let page = page.trim();
    let page = page
        .strip_prefix("p.")
        .or_else(|| page.strip_prefix("с."))
        .unwrap_or(page)
        .trim();
    if id.is_empty() || page.is_empty() {
        return None;
    }
    Some(Citation {
        source_id: id.to_string(),
        page: page.to_string(),
    })
}

/// Remove citation markers from a sentence, returning the cleaned text and
/// every citation found, in order.
pub fn strip_markers(sentence: &str) -> (String, Vec<Citation>) {
    let mut citations = Vec::new();
    let mut out = String::with_capacity(sentence.len());
    let mut rest = sentence;
    while let Some(open) = rest.find(MARKER_OPEN) {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        out.push_str(&rest[..open]);
        if let Some(c) = parse_marker(&rest[open + MARKER_OPEN.len()..open + close]) {
            citations.push(c);
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);

    let mut cleaned = out.split_whitespace().collect::<Vec<_>>().join(" ");
    for p in [".", ",", ";", ":", "!", "?"] {
        cleaned = cleaned.replace(&format!(" {p}"), p);
    }
    (cleaned, citations)
}

// ── Segmentation ──────────────────────────────────────────────────────────

enum Scan {
    Sentence { span: Range<usize>, resume: usize },
    NeedMore,
    Exhausted,
}

enum MarkerLook {
    Marker(usize),
    None,
    NeedMore,
}

/// Is there a citation marker starting at `at`? Returns its end offset.
fn marker_at(buf: &str, at: usize, last: bool) -> MarkerLook {
    let rest = &buf[at..];
    if rest.starts_with(MARKER_OPEN) {
        match rest.find(']') {
            Some(close) => MarkerLook::Marker(at + close + 1),
            None if last => MarkerLook::None,
            None => MarkerLook::NeedMore,
        }
    } else if !last && MARKER_OPEN.starts_with(rest) {
        MarkerLook::NeedMore
    } else {
        MarkerLook::None
    }
}

/// End offset (past the `]`) of the bracket group opening at `at`.
fn group_end(buf: &str, at: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in buf.as_bytes()[at..].iter().enumerate() {
        match b {
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(at + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn trimmed_end(buf: &str, start: usize, end: usize) -> usize {
    start + buf[start..end].trim_end().len()
}

/// Find the next sentence at or after `from`.
///
/// A sentence ends at a newline, or at a run of `.`, `!` or `?` followed by
/// whitespace. A citation marker right after the terminator belongs to the
/// sentence. Bracket groups are atomic, and a review marker is a sentence of
/// its own. When the decision depends on text not yet received, and `last`
/// is false, the scan asks for more.
fn scan(buf: &str, from: usize, last: bool) -> Scan {
    let bytes = buf.as_bytes();
    let len = buf.len();
    let mut start = from;
    while start < len && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    if start >= len {
        return Scan::Exhausted;
    }

    let mut i = start;
    while i < len {
        match bytes[i] {
            b'\n' => {
                return Scan::Sentence {
                    span: start..trimmed_end(buf, start, i),
                    resume: i + 1,
                };
            }
            b'[' => match group_end(buf, i) {
                Some(end) => {
                    if i == start && buf[i..].starts_with(REVIEW_OPEN) {
                        return Scan::Sentence {
                            span: start..end,
                            resume: end,
                        };
                    }
                    i = end;
                }
                None if !last => return Scan::NeedMore,
                None => i += 1,
            },
            b'.' | b'!' | b'?' => {
                let mut j = i;
                while j < len && matches!(bytes[j], b'.' | b'!' | b'?') {
                    j += 1;
                }
                if j == len {
                    if !last {
                        return Scan::NeedMore;
                    }
                    return Scan::Sentence {
                        span: start..j,
                        resume: j,
                    };
                }
                let next = bytes[j];
                if !(next.is_ascii_whitespace() || next == b'[') {
                    i = j;
                    continue;
                }
                // "1." opening a numbered list item
                if bytes[i] == b'.' && buf[start..i].bytes().all(|b| b.is_ascii_digit()) {
                    i = j;
                    continue;
                }
                let mut k = j;
                while k < len && matches!(bytes[k], b' ' | b'\t') {
                    k += 1;
                }
                return match marker_at(buf, k, last) {
                    MarkerLook::Marker(end) => Scan::Sentence {
                        span: start..end,
                        resume: end,
                    },
                    MarkerLook::NeedMore => Scan::NeedMore,
                    MarkerLook::None => Scan::Sentence {
                        span: start..j,
                        resume: j,
                    },
                };
            }
            _ => i += 1,
        }
    }

    if last {
        Scan::Sentence {
            span: start..trimmed_end(buf, start, len),
            resume: len,
        }
    } else {
        Scan::NeedMore
    }
}

/// Incremental sentence splitter over a growing buffer.
///
/// Produces the same spans whether the text arrives whole or in chunks.
/// Spans are byte offsets into [`SentenceSegmenter::text`].
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    consumed: usize,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the sentences it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<Range<usize>> {
        self.buffer.push_str(chunk);
        self.drain(false)
    }

    /// Flush whatever remains as the final sentence.
    pub fn finish(&mut self) -> Vec<Range<usize>> {
        self.drain(true)
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn into_text(self) -> String {
        self.buffer
    }

    fn drain(&mut self, last: bool) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        while let Scan::Sentence { span, resume } = scan(&self.buffer, self.consumed, last) {
            if !span.is_empty() {
                spans.push(span);
            }
            self.consumed = resume;
        }
        spans
    }
}

/// Sentence spans of a complete text.
pub fn segment(text: &str) -> Vec<Range<usize>> {
    let mut segmenter = SentenceSegmenter::new();
    let mut spans = segmenter.push(text);
    spans.extend(segmenter.finish());
    spans
}

/// Turn a sentence into a claim, or `None` for headings, questions, review
/// markers and fragments shorter than three words.
pub fn extract_claim(text: &str, span: Range<usize>, index: usize) -> Option<Claim> {
    let sentence = text.get(span.clone())?.trim();
    if sentence.starts_with(REVIEW_OPEN) || sentence.starts_with('#') {
        return None;
    }
    let (cleaned, citations) = strip_markers(sentence);
    let cleaned = cleaned
        .trim_start_matches(['-', '*', '•', '>'])
        .trim_matches('*')
        .trim()
        .to_string();
    if cleaned.ends_with(':') || cleaned.ends_with('?') {
        return None;
    }
    let words = cleaned
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count();
    if words < 3 {
        return None;
    }
    Some(Claim {
        index,
        text: cleaned,
        span,
        citation: citations.into_iter().next(),
    })
}

/// All claims in a complete text, in document order.
pub fn extract_claims(text: &str) -> Vec<Claim> {
    segment(text)
        .into_iter()
        .filter_map(|span| extract_claim(text, span, 0))
        .enumerate()
        .map(|(index, claim)| Claim { index, ..claim })
        .collect()
}

pub fn review_marker(claim: &str, confidence: f32) -> String {
    format!("{REVIEW_OPEN} (confidence {confidence:.2}): {claim}]")
}

/// Replace every unsupported claim's span with its review marker.
pub fn annotate(text: &str, verdicts: &[ValidationVerdict]) -> String {
    let mut out = text.to_string();
    let mut unsupported: Vec<&ValidationVerdict> =
        verdicts.iter().filter(|v| !v.supported).collect();
    unsupported.sort_by_key(|v| std::cmp::Reverse(v.claim.span.start));
    for v in unsupported {
        if out.get(v.claim.span.clone()).is_some() {
            out.replace_range(
                v.claim.span.clone(),
                &review_marker(&v.claim.text, v.confidence),
            );
        }
    }
    out
}

// ── Page embeddings ───────────────────────────────────────────────────────

/// Page embeddings for one run, shared by the first attempt and the retry.
#[derive(Default)]
pub struct PageEmbeddingMemo {
    vectors: Mutex<HashMap<(String, PageRange), Arc<Vec<f32>>>>,
}

impl PageEmbeddingMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cached_pages(&self) -> usize {
        self.vectors.lock().await.len()
    }

    /// Embeddings for every page of `context`, in context order. Pages not
    /// seen before are encoded in one batch.
    pub async fn ensure(
        &self,
        embedder: &dyn Embedder,
        context: &GenerationContext,
    ) -> Result<Vec<(PageRef, Arc<Vec<f32>>)>, ProviderError> {
        let mut vectors = self.vectors.lock().await;

        let mut missing_keys = Vec::new();
        let mut missing_texts = Vec::new();
        for cp in context.pages() {
            let key = (cp.page.source_id.clone(), cp.page.range);
            if !vectors.contains_key(&key) && !missing_keys.contains(&key) {
                missing_keys.push(key);
                missing_texts.push(cp.page.text.clone());
            }
        }

        if !missing_texts.is_empty() {
            let encoded = embedder.encode_batch(&missing_texts).await?;
            if encoded.len() != missing_texts.len() {
                return Err(ProviderError::MalformedResponse(format!(
                    "expected {} page embeddings, got {}",
                    missing_texts.len(),
                    encoded.len()
                )));
            }
            debug!(pages = encoded.len(), "Context pages embedded");
            for (key, v) in missing_keys.into_iter().zip(encoded) {
                vectors.insert(key, Arc::new(v));
            }
        }

        Ok(context
            .pages()
            .iter()
            .filter_map(|cp| {
                let key = (cp.page.source_id.clone(), cp.page.range);
                vectors.get(&key).map(|v| {
                    (
                        PageRef {
                            source_id: cp.page.source_id.clone(),
                            page: cp.page.range.to_string(),
                        },
                        v.clone(),
                    )
                })
            })
            .collect())
    }
}

// ── Validator ─────────────────────────────────────────────────────────────

/// Result of validating one generated text.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Generated text as received.
    pub raw_text: String,
    /// Text with unsupported claims replaced by review markers.
    pub annotated_text: String,
    pub verdicts: Vec<ValidationVerdict>,
}

impl ValidationOutcome {
    /// Mean claim confidence; 0.0 with no claims.
    pub fn overall_confidence(&self) -> f32 {
        if self.verdicts.is_empty() {
            return 0.0;
        }
        self.verdicts.iter().map(|v| v.confidence).sum::<f32>() / self.verdicts.len() as f32
    }

    pub fn unsupported(&self) -> usize {
        self.verdicts.iter().filter(|v| !v.supported).count()
    }
}

#[derive(Clone)]
pub struct ClaimValidator {
    embedder: Arc<dyn Embedder>,
    support_threshold: f32,
    batch_size: usize,
}

impl ClaimValidator {
    pub fn new(embedder: Arc<dyn Embedder>, support_threshold: f32, batch_size: usize) -> Self {
        Self {
            embedder,
            support_threshold,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &AppConfig) -> Self {
        Self::new(
            embedder,
            config.pipeline.support_threshold,
            config.pipeline.claim_batch_size,
        )
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    /// Open an incremental validation against `context`. Page embeddings are
    /// resolved up front through `memo`.
    pub async fn session(
        &self,
        context: &GenerationContext,
        memo: &PageEmbeddingMemo,
    ) -> Result<ValidationSession, ProviderError> {
        let pages = memo.ensure(self.embedder.as_ref(), context).await?;
        Ok(ValidationSession {
            validator: self.clone(),
            pages,
            segmenter: SentenceSegmenter::new(),
            pending: Vec::new(),
            verdicts: Vec::new(),
        })
    }

    /// Validate a complete text.
    pub async fn validate(
        &self,
        text: &str,
        context: &GenerationContext,
    ) -> Result<ValidationOutcome, ProviderError> {
        let memo = PageEmbeddingMemo::new();
        let mut session = self.session(context, &memo).await?;
        session.push(text).await?;
        session.finish().await
    }

    /// Validate a generation as it streams. The first error from the stream
    /// aborts validation.
    pub async fn validate_stream(
        &self,
        mut chunks: TextReceiver,
        context: &GenerationContext,
    ) -> Result<ValidationOutcome, ProviderError> {
        let memo = PageEmbeddingMemo::new();
        let mut session = self.session(context, &memo).await?;
        while let Some(chunk) = chunks.recv().await {
            session.push(&chunk?).await?;
        }
        session.finish().await
    }
}

/// Validation state for one generated text.
pub struct ValidationSession {
    validator: ClaimValidator,
    pages: Vec<(PageRef, Arc<Vec<f32>>)>,
    segmenter: SentenceSegmenter,
    pending: Vec<Claim>,
    verdicts: Vec<ValidationVerdict>,
}

impl ValidationSession {
    /// Feed the next chunk. Claims are embedded whenever a full batch of
    /// completed sentences is pending.
    pub async fn push(&mut self, chunk: &str) -> Result<(), ProviderError> {
        let spans = self.segmenter.push(chunk);
        self.collect(spans);
        if self.pending.len() >= self.validator.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn received(&self) -> &str {
        self.segmenter.text()
    }

    pub async fn finish(mut self) -> Result<ValidationOutcome, ProviderError> {
        let spans = self.segmenter.finish();
        self.collect(spans);
        self.flush().await?;

        let raw_text = self.segmenter.into_text();
        let annotated_text = annotate(&raw_text, &self.verdicts);
        let outcome = ValidationOutcome {
            raw_text,
            annotated_text,
            verdicts: self.verdicts,
        };
        info!(
            claims = outcome.verdicts.len(),
            unsupported = outcome.unsupported(),
            confidence = outcome.overall_confidence(),
            "Claims validated"
        );
        Ok(outcome)
    }

    fn collect(&mut self, spans: Vec<Range<usize>>) {
        for span in spans {
            let index = self.verdicts.len() + self.pending.len();
            if let Some(claim) = extract_claim(self.segmenter.text(), span, index) {
                self.pending.push(claim);
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ProviderError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let claims = std::mem::take(&mut self.pending);
        let texts: Vec<String> = claims.iter().map(|c| c.text.clone()).collect();
        let vectors = self.validator.embedder.encode_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} claim embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        debug!(claims = claims.len(), "Claim batch embedded");

        for (claim, vector) in claims.into_iter().zip(vectors) {
            let best = self
                .pages
                .iter()
                .map(|(page, pv)| (page, cosine_similarity(&vector, pv)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let (best_match, confidence) = match best {
                Some((page, sim)) => (Some(page.clone()), sim.clamp(0.0, 1.0)),
                None => (None, 0.0),
            };
            self.verdicts.push(ValidationVerdict {
                claim,
                supported: confidence >= self.validator.support_threshold,
                confidence,
                best_match,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RuleEmbedder, context_of};

    const TEXT: &str = "# Энтропия\n\
        Энтропия изолированной системы не убывает. [src:b1, p.12] \
        Теплота переходит от горячего тела к холодному [src:b1, p.13].\n\
        Луна сделана из сыра целиком. [src:b2, p.4]\n\
        Что такое энтропия?\n";

    fn embedder() -> Arc<RuleEmbedder> {
        Arc::new(
            RuleEmbedder::new(vec![0.0, 0.0, 1.0])
                .rule("Луна", vec![0.4, 0.916_515_1, 0.0])
                .rule("", vec![1.0, 0.0, 0.0]),
        )
    }

    fn validator(embedder: Arc<RuleEmbedder>) -> ClaimValidator {
        ClaimValidator::new(embedder, 0.7, 16)
    }

    #[test]
    fn markers_are_parsed_and_stripped() {
        let (text, cites) = strip_markers("Энтропия растёт [src:b1, p.12-14] в системе [src:b2, p.3].");
        assert_eq!(text, "Энтропия растёт в системе.");
        assert_eq!(cites.len(), 2);
        assert_eq!(cites[0].source_id, "b1");
        assert_eq!(cites[0].page, "12-14");
    }

    #[test]
    fn trailing_marker_attaches_to_sentence() {
        let spans = segment(TEXT);
        let sentences: Vec<&str> = spans.iter().map(|s| &TEXT[s.clone()]).collect();
        assert_eq!(
            sentences,
            vec![
                "# Энтропия",
                "Энтропия изолированной системы не убывает. [src:b1, p.12]",
                "Теплота переходит от горячего тела к холодному [src:b1, p.13].",
                "Луна сделана из сыра целиком. [src:b2, p.4]",
                "Что такое энтропия?",
            ]
        );
    }

    #[test]
    fn chunked_segmentation_matches_whole() {
        let whole = segment(TEXT);
        for size in [1, 3, 7, 16] {
            let mut segmenter = SentenceSegmenter::new();
            let mut spans = Vec::new();
            let chars: Vec<char> = TEXT.chars().collect();
            for piece in chars.chunks(size) {
                spans.extend(segmenter.push(&piece.iter().collect::<String>()));
            }
            spans.extend(segmenter.finish());
            assert_eq!(spans, whole, "chunk size {size}");
        }
    }

    #[test]
    fn numbers_and_list_items_do_not_split() {
        let text = "1. Теплоёмкость воды равна 4.18 Дж на грамм.";
        let spans = segment(text);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn headings_questions_and_fragments_are_not_claims() {
        let claims = extract_claims(TEXT);
        assert_eq!(claims.len(), 3);
        assert_eq!(claims[0].index, 0);
        assert_eq!(claims[0].text, "Энтропия изолированной системы не убывает.");
        assert_eq!(claims[0].citation.as_ref().unwrap().page, "12");
        assert_eq!(claims[2].citation.as_ref().unwrap().source_id, "b2");
        assert!(extract_claims("Цели лекции:\nКратко.\n").is_empty());
    }

    #[tokio::test]
    async fn low_similarity_claim_is_marked_in_place() {
        let ctx = context_of(&[("b1", 12, "Энтропия изолированной системы не убывает.")]);
        let outcome = validator(embedder()).validate(TEXT, &ctx).await.unwrap();

        assert_eq!(outcome.verdicts.len(), 3);
        assert!(outcome.verdicts[0].supported);
        assert!(outcome.verdicts[1].supported);
        let moon = &outcome.verdicts[2];
        assert!(!moon.supported);
        assert!((moon.confidence - 0.4).abs() < 1e-3);
        assert_eq!(moon.best_match.as_ref().unwrap().page, "12");

        assert!(outcome.annotated_text.contains(
            "[NEEDS REVIEW (confidence 0.40): Луна сделана из сыра целиком.]\n"
        ));
        assert!(!outcome.annotated_text.contains("[src:b2, p.4]"));
        assert!(outcome.annotated_text.contains(
            "Энтропия изолированной системы не убывает. [src:b1, p.12]"
        ));
        assert!((outcome.overall_confidence() - 0.8).abs() < 1e-3);
    }

    #[tokio::test]
    async fn validation_is_idempotent() {
        let ctx = context_of(&[("b1", 12, "Энтропия изолированной системы не убывает.")]);
        let v = validator(embedder());

        let first = v.validate(TEXT, &ctx).await.unwrap();
        let again = v.validate(TEXT, &ctx).await.unwrap();
        assert_eq!(first.verdicts, again.verdicts);

        let revalidated = v.validate(&first.annotated_text, &ctx).await.unwrap();
        assert_eq!(revalidated.annotated_text, first.annotated_text);
    }

    #[tokio::test]
    async fn stream_batches_claims_and_memoizes_pages() {
        let embedder = embedder();
        let ctx = context_of(&[("b1", 12, "a"), ("b1", 13, "b")]);
        let v = ClaimValidator::new(embedder.clone(), 0.7, 2);
        let memo = PageEmbeddingMemo::new();

        let mut session = v.session(&ctx, &memo).await.unwrap();
        for line in TEXT.split_inclusive('\n') {
            session.push(line).await.unwrap();
        }
        let outcome = session.finish().await.unwrap();
        assert_eq!(outcome.verdicts.len(), 3);
        assert_eq!(outcome.raw_text, TEXT);
        // one page batch, one full claim batch, one remainder
        assert_eq!(embedder.batch_calls(), 3);

        let _ = v.session(&ctx, &memo).await.unwrap();
        assert_eq!(embedder.batch_calls(), 3);
        assert_eq!(memo.cached_pages().await, 2);
    }

    #[tokio::test]
    async fn no_claims_means_zero_confidence() {
        let ctx = context_of(&[("b1", 1, "x")]);
        let outcome = validator(embedder()).validate("# Заголовок\n", &ctx).await.unwrap();
        assert!(outcome.verdicts.is_empty());
        assert_eq!(outcome.overall_confidence(), 0.0);
    }

    #[tokio::test]
    async fn empty_context_leaves_every_claim_unsupported() {
        let ctx = GenerationContext::empty(100);
        let outcome = validator(embedder())
            .validate("Энтропия изолированной системы не убывает.", &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.verdicts.len(), 1);
        assert!(!outcome.verdicts[0].supported);
        assert!(outcome.verdicts[0].best_match.is_none());
    }
}
