//! End-to-end tests for the content generation pipeline.
//!
//! These run the full coordinator from topic to formatted artifact against a
//! scripted inference engine, an in-memory corpus, and the real hashing
//! embedder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coursegen_cache::ResultCache;
use coursegen_config::AppConfig;
use coursegen_core::{
    AcademicDegree, CorpusError, CurriculumMetadata, FailureReason, LiteratureCorpus, Message,
    Page, Provider, ProviderError, ProviderRequest, ProviderResponse, RunStage, SourceCandidate,
    TocEntry, Topic,
};
use coursegen_pipeline::{PipelineCoordinator, RunRequest};
use coursegen_providers::HashingEmbedder;

// ── Mock engine ──────────────────────────────────────────────────────────

/// Answers every request with the same lecture text.
struct LectureEngine {
    lecture: String,
    call_count: Mutex<usize>,
}

impl LectureEngine {
    fn new(lecture: &str) -> Self {
        Self {
            lecture: lecture.to_string(),
            call_count: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl Provider for LectureEngine {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        Ok(ProviderResponse {
            message: Message::assistant(&self.lecture),
            usage: None,
            model: request.model,
        })
    }
}

// ── Mock corpus ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Shelf {
    books: HashMap<String, Vec<Page>>,
}

impl Shelf {
    fn with_book(mut self, id: &str, pages: &[(u32, &str)]) -> Self {
        let pages = pages
            .iter()
            .map(|(number, text)| Page {
                number: *number,
                text: (*text).to_string(),
            })
            .collect();
        self.books.insert(id.to_string(), pages);
        self
    }
}

#[async_trait]
impl LiteratureCorpus for Shelf {
    fn name(&self) -> &str {
        "shelf"
    }

    async fn search(
        &self,
        _title: &str,
        _authors: &str,
    ) -> Result<Option<SourceCandidate>, CorpusError> {
        Ok(None)
    }

    async fn get_full_text(&self, source_id: &str) -> Result<Vec<Page>, CorpusError> {
        self.books
            .get(source_id)
            .cloned()
            .ok_or_else(|| CorpusError::SourceNotFound(source_id.to_string()))
    }

    async fn get_table_of_contents(&self, _source_id: &str) -> Result<Vec<TocEntry>, CorpusError> {
        Ok(Vec::new())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

const LECTURE: &str = "# Термодинамика\n\
    ## Основная часть\n\
    Термодинамика изучает тепловые процессы в системах. [src:b1, p.1]\n\
    Луна сделана из сыра целиком. [src:b2, p.3]\n\
    ## Вопросы\n\
    Что изучает термодинамика?\n";

fn shelf() -> Shelf {
    Shelf::default()
        .with_book("b1", &[(1, "Термодинамика изучает тепловые процессы в системах.")])
        .with_book("b2", &[(3, "Термодинамика газов и паров.")])
}

fn sources() -> Vec<SourceCandidate> {
    vec![
        SourceCandidate::new("b1", "Термодинамика", "Кириллин"),
        SourceCandidate::new("b2", "Термодинамика и статистическая физика", "Базаров"),
    ]
}

fn topic() -> Topic {
    Topic::new("Термодинамика", AcademicDegree::Bachelor, "Физика")
}

fn pipeline(engine: Arc<LectureEngine>, config: &AppConfig) -> PipelineCoordinator {
    let cache = Arc::new(ResultCache::in_memory(1000, config.cache.ttl()));
    PipelineCoordinator::new(
        engine,
        Arc::new(HashingEmbedder::new(384)),
        Arc::new(shelf()),
        cache,
        config,
    )
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_grounded_claim_passes_and_invented_claim_is_marked() {
    let engine = Arc::new(LectureEngine::new(LECTURE));
    let pipeline = pipeline(engine.clone(), &AppConfig::default());

    let artifact = pipeline
        .run(&topic(), &CurriculumMetadata::default(), &sources())
        .await
        .unwrap();

    // Clear title matches need no relevance inference; one generation call.
    assert_eq!(engine.calls(), 1);
    assert_eq!(artifact.sources.len(), 2);

    assert_eq!(artifact.verdicts.len(), 2);
    let grounded = &artifact.verdicts[0];
    assert!(grounded.supported);
    assert!(grounded.confidence > 0.99);
    assert_eq!(grounded.best_match.as_ref().unwrap().source_id, "b1");

    let invented = &artifact.verdicts[1];
    assert!(!invented.supported);
    assert!(invented.confidence < 0.5);

    assert!(artifact.requires_review);
    assert!(artifact.overall_confidence < 0.7);
    assert!(artifact.text.starts_with("# Физика"));
    assert!(
        artifact
            .text
            .contains("Термодинамика изучает тепловые процессы в системах. [src:b1, p.1]")
    );
    assert!(artifact.text.contains("[NEEDS REVIEW (confidence "));
    assert!(artifact.text.contains("Луна сделана из сыра целиком.]"));
    assert!(!artifact.text.contains("[src:b2, p.3]"));
}

#[tokio::test]
async fn e2e_unrelated_literature_fails_before_generation() {
    let engine = Arc::new(LectureEngine::new(LECTURE));
    let pipeline = pipeline(engine.clone(), &AppConfig::default());
    let unrelated = vec![
        SourceCandidate::new("c1", "Органическая химия", ""),
        SourceCandidate::new("c2", "Линейная алгебра", ""),
    ];

    let failure = pipeline
        .run(&topic(), &CurriculumMetadata::default(), &unrelated)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, RunStage::Relevance);
    assert_eq!(failure.reason, FailureReason::NoRelevantSource);
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn e2e_batch_reports_each_topic() {
    let engine = Arc::new(LectureEngine::new(LECTURE));
    let pipeline = pipeline(engine, &AppConfig::default());
    let requests = vec![
        RunRequest {
            topic: topic(),
            metadata: CurriculumMetadata::default(),
            sources: sources(),
        },
        RunRequest {
            topic: topic(),
            metadata: CurriculumMetadata::default(),
            sources: vec![SourceCandidate::new("c1", "Органическая химия", "")],
        },
    ];

    let report = pipeline.run_batch(&requests).await;

    assert_eq!(report.results.len(), 2);
    assert!(report.results[0].is_ok());
    assert!(report.results[1].is_err());
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.failed, 1);
    assert!((report.summary.success_rate - 0.5).abs() < 1e-9);
}
