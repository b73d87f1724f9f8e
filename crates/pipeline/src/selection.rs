//! Page selection: pick the pages of each relevant source worth putting in
//! front of the model.
//!
//! Two strategies run per source and their candidates are merged:
//!
//! - **Table of contents**: sections whose title matches the topic contribute
//!   every page in their range.
//! - **Keyword density**: a per-page keyword index yields pages where topic
//!   keywords make up at least `keyword_density_threshold` of the words.
//!
//! The merged candidates are ranked by a composite score in which density
//! weighs more than a TOC match. Only page numbers and signals are cached;
//! page text is always read fresh from the corpus.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use coursegen_cache::{Computed, Fingerprint, ResultCache, namespaces};
use coursegen_config::AppConfig;
use coursegen_core::{
    CorpusError, LiteratureCorpus, Page, PageContent, PageRange, RelevanceSignal,
    RelevanceVerdict, TocEntry, Topic,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::text;

const DENSITY_WEIGHT: f32 = 0.6;
const TOC_WEIGHT: f32 = 0.4;
/// Density at which the density score saturates.
const DENSITY_SATURATION: f32 = 0.1;
/// Minimum title match for a TOC section to count.
const TOC_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct SelectionSettings {
    pub pages_per_source_cap: usize,
    pub keyword_density_threshold: f32,
    pub max_parallel_sources: usize,
    pub per_source_timeout: Duration,
    pub cache_ttl: Duration,
}

impl SelectionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pages_per_source_cap: config.pipeline.pages_per_source_cap,
            keyword_density_threshold: config.pipeline.keyword_density_threshold,
            max_parallel_sources: config.runtime.max_parallel_sources,
            per_source_timeout: config.timeouts.per_source(),
            cache_ttl: config.cache.ttl(),
        }
    }
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ── Keyword index ─────────────────────────────────────────────────────────

struct IndexedPage {
    number: u32,
    word_count: usize,
    terms: HashMap<String, usize>,
}

/// Per-page term counts for one source, built once from its full text.
pub struct KeywordIndex {
    pages: Vec<IndexedPage>,
}

impl KeywordIndex {
    pub fn build(pages: &[Page]) -> Self {
        let pages = pages
            .iter()
            .map(|page| {
                let tokens = text::tokenize(&page.text);
                let mut terms: HashMap<String, usize> = HashMap::new();
                for token in &tokens {
                    *terms.entry(token.clone()).or_default() += 1;
                }
                IndexedPage {
                    number: page.number,
                    word_count: tokens.len(),
                    terms,
                }
            })
            .collect();
        Self { pages }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Pages whose keyword density meets `threshold`, as `(page, density)`.
    ///
    /// A page term counts toward the density when it is an inflection of any
    /// keyword.
    pub fn dense_pages(&self, keywords: &[String], threshold: f32) -> Vec<(u32, f32)> {
        if keywords.is_empty() {
            return Vec::new();
        }
        self.pages
            .iter()
            .filter(|p| p.word_count > 0)
            .filter_map(|p| {
                let hits: usize = p
                    .terms
                    .iter()
                    .filter(|(term, _)| keywords.iter().any(|k| text::stems_match(term, k)))
                    .map(|(_, count)| count)
                    .sum();
                let density = hits as f32 / p.word_count as f32;
                (density >= threshold && hits > 0).then_some((p.number, density))
            })
            .collect()
    }
}

// ── Scoring ───────────────────────────────────────────────────────────────

/// A selected page number with the signals that selected it. This is what
/// the cache holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedPage {
    pub number: u32,
    pub signal: RelevanceSignal,
}

pub fn composite_score(toc_match: Option<f32>, keyword_density: Option<f32>) -> f32 {
    let density_score = keyword_density
        .map(|d| (d / DENSITY_SATURATION).min(1.0))
        .unwrap_or(0.0);
    DENSITY_WEIGHT * density_score + TOC_WEIGHT * toc_match.unwrap_or(0.0)
}

/// Pages covered by TOC sections that match the topic, with the best match
/// score per page.
pub fn toc_candidates(keywords: &[String], toc: &[TocEntry]) -> BTreeMap<u32, f32> {
    let mut pages = BTreeMap::new();
    for entry in toc {
        let score = text::match_score(keywords, &text::tokenize(&entry.title));
        if score < TOC_MATCH_THRESHOLD || entry.end_page < entry.start_page {
            continue;
        }
        for page in entry.start_page..=entry.end_page {
            let best = pages.entry(page).or_insert(0.0f32);
            *best = best.max(score);
        }
    }
    pages
}

/// Merge both strategies, rank, and cap.
pub fn rank_pages(
    keywords: &[String],
    toc: &[TocEntry],
    index: &KeywordIndex,
    density_threshold: f32,
    cap: usize,
) -> Vec<SelectedPage> {
    let toc_pages = toc_candidates(keywords, toc);
    let dense: BTreeMap<u32, f32> = index
        .dense_pages(keywords, density_threshold)
        .into_iter()
        .collect();

    let known: std::collections::HashSet<u32> = index.pages.iter().map(|p| p.number).collect();
    let mut numbers: Vec<u32> = toc_pages
        .keys()
        .chain(dense.keys())
        .copied()
        .filter(|n| known.contains(n))
        .collect();
    numbers.sort_unstable();
    numbers.dedup();

    let mut selected: Vec<SelectedPage> = numbers
        .into_iter()
        .map(|number| {
            let toc_match = toc_pages.get(&number).copied();
            let keyword_density = dense.get(&number).copied();
            SelectedPage {
                number,
                signal: RelevanceSignal {
                    toc_match,
                    keyword_density,
                    composite: composite_score(toc_match, keyword_density),
                },
            }
        })
        .collect();

    selected.sort_by(|a, b| {
        b.signal
            .composite
            .total_cmp(&a.signal.composite)
            .then(a.number.cmp(&b.number))
    });
    selected.truncate(cap);
    selected
}

// ── Selector ──────────────────────────────────────────────────────────────

/// How one source's page loading ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceStatus {
    Loaded,
    /// Loaded, but nothing matched the topic.
    Empty,
    TimedOut,
    /// The corpus could not be reached.
    Unavailable(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SourceSelection {
    pub source_id: String,
    pub rank: usize,
    pub pages: Vec<PageContent>,
    pub status: SourceStatus,
}

/// Per-source selections in acceptance-rank order.
#[derive(Debug, Clone, Default)]
pub struct SelectionOutcome {
    pub sources: Vec<SourceSelection>,
}

impl SelectionOutcome {
    pub fn total_pages(&self) -> usize {
        self.sources.iter().map(|s| s.pages.len()).sum()
    }

    /// Whether every source failed because the corpus was unreachable.
    pub fn all_unavailable(&self) -> bool {
        !self.sources.is_empty()
            && self
                .sources
                .iter()
                .all(|s| matches!(s.status, SourceStatus::Unavailable(_)))
    }

    /// All pages, sources in rank order.
    pub fn into_pages(self) -> Vec<PageContent> {
        self.sources.into_iter().flat_map(|s| s.pages).collect()
    }
}

#[derive(Clone)]
pub struct PageSelector {
    corpus: Arc<dyn LiteratureCorpus>,
    cache: Arc<ResultCache>,
    settings: Arc<SelectionSettings>,
}

impl PageSelector {
    pub fn new(
        corpus: Arc<dyn LiteratureCorpus>,
        cache: Arc<ResultCache>,
        settings: SelectionSettings,
    ) -> Self {
        Self {
            corpus,
            cache,
            settings: Arc::new(settings),
        }
    }

    fn fingerprint(&self, topic: &Topic, source_id: &str) -> Fingerprint {
        let cap = self.settings.pages_per_source_cap.to_string();
        let threshold = self.settings.keyword_density_threshold.to_string();
        Fingerprint::builder(namespaces::SELECTION)
            .text("theme", &topic.theme)
            .exact("source", source_id)
            .exact("cap", &cap)
            .exact("density", &threshold)
            .finish()
    }

    /// Select up to `pages_per_source_cap` pages from one source, best first.
    pub async fn select(
        &self,
        verdict: &RelevanceVerdict,
        rank: usize,
        topic: &Topic,
    ) -> Result<Vec<PageContent>, CorpusError> {
        let source = &verdict.source;
        let pages = self.corpus.get_full_text(&source.id).await?;
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let key = self.fingerprint(topic, &source.id);
        let keywords = text::tokenize(&topic.theme);
        let Ok(selected) = self
            .cache
            .get_or_compute(&key, self.settings.cache_ttl, || async {
                let (toc, toc_ok) = match self.corpus.get_table_of_contents(&source.id).await {
                    Ok(toc) => (toc, true),
                    Err(e) => {
                        warn!(source_id = %source.id, error = %e, "TOC unavailable, using keyword density only");
                        (Vec::new(), false)
                    }
                };
                let index = KeywordIndex::build(&pages);
                let selected = rank_pages(
                    &keywords,
                    &toc,
                    &index,
                    self.settings.keyword_density_threshold,
                    self.settings.pages_per_source_cap,
                );
                Ok::<_, Infallible>(if toc_ok {
                    Computed::Store(selected)
                } else {
                    Computed::Transient(selected)
                })
            })
            .await;

        let by_number: HashMap<u32, &Page> = pages.iter().map(|p| (p.number, p)).collect();
        let contents = selected
            .into_iter()
            .filter_map(|sel| {
                by_number.get(&sel.number).map(|page| PageContent {
                    source_id: source.id.clone(),
                    source_title: source.title.clone(),
                    range: PageRange::single(sel.number),
                    text: page.text.clone(),
                    signal: sel.signal,
                    source_rank: rank,
                })
            })
            .collect::<Vec<_>>();

        debug!(source_id = %source.id, pages = contents.len(), "Pages selected");
        Ok(contents)
    }

    /// Select pages for every given source concurrently.
    ///
    /// At most `max_parallel_sources` sources load at once, each under
    /// `per_source_timeout`. A source that times out or fails contributes no
    /// pages. Results are ordered by acceptance rank regardless of which task
    /// finishes first. Dropping the returned future aborts all loads.
    pub async fn select_all(&self, sources: &[RelevanceVerdict], topic: &Topic) -> SelectionOutcome {
        let pool = Arc::new(Semaphore::new(self.settings.max_parallel_sources.max(1)));
        let mut tasks = JoinSet::new();

        let mut slots: Vec<SourceSelection> = sources
            .iter()
            .enumerate()
            .map(|(rank, v)| SourceSelection {
                source_id: v.source.id.clone(),
                rank,
                pages: Vec::new(),
                status: SourceStatus::Failed("task aborted".into()),
            })
            .collect();

        for (rank, verdict) in sources.iter().enumerate() {
            let selector = self.clone();
            let verdict = verdict.clone();
            let topic = topic.clone();
            let pool = pool.clone();
            tasks.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return (rank, Vec::new(), SourceStatus::Failed("worker pool closed".into()));
                };
                let timeout = selector.settings.per_source_timeout;
                match tokio::time::timeout(timeout, selector.select(&verdict, rank, &topic)).await {
                    Ok(Ok(pages)) if pages.is_empty() => (rank, pages, SourceStatus::Empty),
                    Ok(Ok(pages)) => (rank, pages, SourceStatus::Loaded),
                    Ok(Err(CorpusError::Unavailable(reason))) => {
                        (rank, Vec::new(), SourceStatus::Unavailable(reason))
                    }
                    Ok(Err(e)) => (rank, Vec::new(), SourceStatus::Failed(e.to_string())),
                    Err(_) => (rank, Vec::new(), SourceStatus::TimedOut),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((rank, pages, status)) => {
                    if let Some(slot) = slots.get_mut(rank) {
                        match &status {
                            SourceStatus::Loaded | SourceStatus::Empty => {}
                            other => warn!(source_id = %slot.source_id, status = ?other, "Source contributed no pages"),
                        }
                        slot.pages = pages;
                        slot.status = status;
                    }
                }
                Err(e) => warn!(error = %e, "Page loading task did not complete"),
            }
        }

        let outcome = SelectionOutcome { sources: slots };
        info!(
            sources = sources.len(),
            pages = outcome.total_pages(),
            "Page selection finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{MemoryCorpus, book};
    use coursegen_core::{AcademicDegree, SourceCandidate, VerdictMethod};

    fn topic() -> Topic {
        Topic::new("Энтропия", AcademicDegree::Bachelor, "physics")
    }

    fn verdict(id: &str) -> RelevanceVerdict {
        RelevanceVerdict {
            source: SourceCandidate::new(id, format!("Book {id}"), ""),
            score: 1.0,
            method: VerdictMethod::Algorithmic,
            flagged_for_manual_inclusion: false,
        }
    }

    fn page(number: u32, text: &str) -> Page {
        Page {
            number,
            text: text.into(),
        }
    }

    fn toc(title: &str, start: u32, end: u32) -> TocEntry {
        TocEntry {
            title: title.into(),
            start_page: start,
            end_page: end,
        }
    }

    fn selector(corpus: Arc<MemoryCorpus>, settings: SelectionSettings) -> PageSelector {
        let cache = Arc::new(ResultCache::in_memory(100, Duration::from_secs(60)));
        PageSelector::new(corpus, cache, settings)
    }

    #[test]
    fn density_counts_inflections() {
        let index = KeywordIndex::build(&[
            page(1, "Энтропия системы растёт. Рост энтропии необратим."),
            page(2, "Кинетическая энергия тела."),
        ]);
        let dense = index.dense_pages(&text::tokenize("Энтропия"), 0.02);
        assert_eq!(dense.len(), 1);
        assert_eq!(dense[0].0, 1);
        assert!(dense[0].1 > 0.2);
    }

    #[test]
    fn density_outranks_toc() {
        let index = KeywordIndex::build(&[
            page(1, "Введение в курс лекций по общей физике и механике."),
            page(2, "Энтропия определяется как мера беспорядка. Энтропия растёт."),
        ]);
        let toc = vec![toc("Энтропия", 1, 1)];
        let ranked = rank_pages(&text::tokenize("Энтропия"), &toc, &index, 0.02, 15);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].number, 2);
        assert!(ranked[0].signal.keyword_density.is_some());
        assert!(ranked[0].signal.toc_match.is_none());
        assert_eq!(ranked[1].signal.toc_match, Some(1.0));
        assert!((ranked[1].signal.composite - 0.4).abs() < 1e-6);
    }

    #[test]
    fn composite_weights() {
        assert!((composite_score(Some(1.0), Some(0.1)) - 1.0).abs() < 1e-6);
        assert!((composite_score(None, Some(0.05)) - 0.3).abs() < 1e-6);
        assert!((composite_score(Some(0.5), None) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn toc_ranges_expand_and_respect_cap() {
        let pages: Vec<Page> = (1..=30).map(|n| page(n, "Текст без ключевых слов.")).collect();
        let index = KeywordIndex::build(&pages);
        let toc = vec![toc("Глава 3. Энтропия и второе начало", 5, 25), toc("Механика", 1, 4)];
        let ranked = rank_pages(&text::tokenize("Энтропия"), &toc, &index, 0.02, 15);
        assert_eq!(ranked.len(), 15);
        assert_eq!(ranked[0].number, 5);
        assert!(ranked.iter().all(|p| (5..=25).contains(&p.number)));
    }

    #[tokio::test]
    async fn select_caches_page_numbers_not_text() {
        let corpus = Arc::new(MemoryCorpus::new().with_book(book(
            "b1",
            vec![page(1, "Энтропия и теплота."), page(2, "Механика.")],
            vec![],
        )));
        let sel = selector(corpus.clone(), SelectionSettings::default());

        let first = sel.select(&verdict("b1"), 0, &topic()).await.unwrap();
        let second = sel.select(&verdict("b1"), 0, &topic()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].range, PageRange::single(1));
        assert_eq!(second[0].text, "Энтропия и теплота.");
        assert_eq!(corpus.toc_calls(), 1);
        assert_eq!(corpus.full_text_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_others_keep_rank_order() {
        let corpus = Arc::new(
            MemoryCorpus::new()
                .with_book(book("slow", vec![page(1, "Энтропия.")], vec![]).with_delay(Duration::from_secs(60)))
                .with_book(book("b2", vec![page(3, "Энтропия газа.")], vec![]).with_delay(Duration::from_secs(2)))
                .with_book(book("b3", vec![page(7, "Энтропия растёт.")], vec![])),
        );
        let settings = SelectionSettings {
            per_source_timeout: Duration::from_secs(20),
            ..SelectionSettings::default()
        };
        let sel = selector(corpus, settings);

        let outcome = sel
            .select_all(&[verdict("slow"), verdict("b2"), verdict("b3")], &topic())
            .await;

        assert_eq!(outcome.sources[0].status, SourceStatus::TimedOut);
        assert!(outcome.sources[0].pages.is_empty());
        let ids: Vec<_> = outcome.sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "b2", "b3"]);
        let pages = outcome.into_pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].source_id, "b2");
        assert_eq!(pages[0].source_rank, 1);
        assert_eq!(pages[1].source_id, "b3");
    }

    #[tokio::test]
    async fn unreachable_corpus_is_reported() {
        let corpus = Arc::new(MemoryCorpus::new().unavailable());
        let sel = selector(corpus, SelectionSettings::default());
        let outcome = sel.select_all(&[verdict("b1"), verdict("b2")], &topic()).await;
        assert_eq!(outcome.total_pages(), 0);
        assert!(outcome.all_unavailable());
    }
}
