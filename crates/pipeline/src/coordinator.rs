//! The per-run state machine.
//!
//! ```text
//! Pending → Relevance → Selection → Generation → Validation → Formatting → Done
//!                                                            (any) → Failed
//! ```
//!
//! Every stage runs under its own timeout and the whole run under the run
//! timeout. On expiry the in-flight stage future is dropped, which aborts its
//! tasks and releases any cache computation it held. No partial artifact is
//! ever returned.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use coursegen_cache::ResultCache;
use coursegen_config::{AppConfig, TimeoutConfig};
use coursegen_core::{
    ContentArtifact, CurriculumMetadata, Embedder, FailureReason, GenerationContext,
    LiteratureCorpus, Provider, ProviderError, RunFailure, RunStage, SourceCandidate, StageTiming,
    Topic,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ContextBuilder;
use crate::generation::{ContentGenerator, TemplateSpec};
use crate::relevance::{RelevanceEvaluator, RelevanceSettings};
use crate::selection::{PageSelector, SelectionSettings, SourceStatus};
use crate::template::{TemplateFormatter, TemplateRegistry};
use crate::validation::{ClaimValidator, PageEmbeddingMemo, ValidationSession};

const INFERENCE_ENGINE: &str = "inference engine";
const EMBEDDING_MODEL: &str = "embedding model";
const LITERATURE_CORPUS: &str = "literature corpus";

/// Why one generation attempt did not produce a validated stream.
enum AttemptError {
    Provider(ProviderError),
    Embedder(ProviderError),
    TimedOut,
}

/// Run `fut` as `stage`: publish the stage, time it, and enforce `limit`.
async fn in_stage<T>(
    run_id: &str,
    stage_tx: &watch::Sender<RunStage>,
    stage: RunStage,
    limit: Duration,
    timings: &mut Vec<StageTiming>,
    fut: impl Future<Output = T>,
) -> Result<T, FailureReason> {
    stage_tx.send_replace(stage);
    debug!(run_id, stage = %stage, "Stage started");
    let started = Instant::now();
    let out = tokio::time::timeout(limit, fut).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    timings.push(StageTiming { stage, elapsed_ms });
    match out {
        Ok(value) => {
            info!(run_id, stage = %stage, elapsed_ms, "Stage finished");
            Ok(value)
        }
        Err(_) => {
            warn!(run_id, stage = %stage, elapsed_ms, "Stage deadline exceeded");
            Err(FailureReason::DeadlineExceeded { stage })
        }
    }
}

pub struct PipelineCoordinator {
    relevance: RelevanceEvaluator,
    selector: PageSelector,
    context: ContextBuilder,
    generator: ContentGenerator,
    validator: ClaimValidator,
    formatter: TemplateFormatter,
    template_spec: TemplateSpec,
    timeouts: TimeoutConfig,
    review_threshold: f32,
    runs: Semaphore,
    cache: Arc<ResultCache>,
}

impl PipelineCoordinator {
    pub fn new(
        provider: Arc<dyn Provider>,
        embedder: Arc<dyn Embedder>,
        corpus: Arc<dyn LiteratureCorpus>,
        cache: Arc<ResultCache>,
        config: &AppConfig,
    ) -> Self {
        Self {
            relevance: RelevanceEvaluator::new(
                provider.clone(),
                cache.clone(),
                config.provider.model.clone(),
                RelevanceSettings::from_config(config),
            ),
            selector: PageSelector::new(
                corpus,
                cache.clone(),
                SelectionSettings::from_config(config),
            ),
            context: ContextBuilder::new(config.pipeline.max_context_tokens),
            generator: ContentGenerator::from_config(provider, config),
            validator: ClaimValidator::from_config(embedder, config),
            formatter: TemplateFormatter::new(
                TemplateRegistry::builtin(),
                cache.clone(),
                config.cache.template_ttl(),
            ),
            template_spec: TemplateSpec::lecture(),
            timeouts: config.timeouts.clone(),
            review_threshold: config.pipeline.review_threshold,
            runs: Semaphore::new(config.runtime.max_concurrent_runs.max(1)),
            cache,
        }
    }

    pub fn with_template_spec(mut self, spec: TemplateSpec) -> Self {
        self.template_spec = spec;
        self
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Produce one validated, formatted artifact for a topic.
    pub async fn run(
        &self,
        topic: &Topic,
        metadata: &CurriculumMetadata,
        sources: &[SourceCandidate],
    ) -> Result<ContentArtifact, RunFailure> {
        let (stage_tx, _stage_rx) = watch::channel(RunStage::Pending);
        self.run_observed(topic, metadata, sources, &stage_tx).await
    }

    /// Like [`run`](Self::run), publishing every stage transition on `stage_tx`.
    ///
    /// Waiting for a run slot does not count against the run timeout.
    pub async fn run_observed(
        &self,
        topic: &Topic,
        metadata: &CurriculumMetadata,
        sources: &[SourceCandidate],
        stage_tx: &watch::Sender<RunStage>,
    ) -> Result<ContentArtifact, RunFailure> {
        let run_id = Uuid::new_v4().to_string();
        stage_tx.send_replace(RunStage::Pending);

        let Ok(_permit) = self.runs.acquire().await else {
            stage_tx.send_replace(RunStage::Failed);
            return Err(RunFailure::new(
                run_id,
                RunStage::Pending,
                FailureReason::DependencyUnavailable {
                    dependency: "run scheduler".into(),
                    reason: "closed".into(),
                },
            ));
        };

        info!(
            run_id = %run_id,
            theme = %topic.theme,
            discipline = %topic.discipline,
            sources = sources.len(),
            "Run started"
        );
        let started = Instant::now();

        let result = match tokio::time::timeout(
            self.timeouts.run(),
            self.execute(&run_id, topic, metadata, sources, stage_tx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let stage = *stage_tx.borrow();
                Err(RunFailure::new(
                    run_id.clone(),
                    stage,
                    FailureReason::DeadlineExceeded { stage },
                ))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(artifact) => {
                stage_tx.send_replace(RunStage::Done);
                info!(
                    run_id = %run_id,
                    elapsed_ms,
                    confidence = artifact.overall_confidence,
                    requires_review = artifact.requires_review,
                    "Run finished"
                );
            }
            Err(failure) => {
                stage_tx.send_replace(RunStage::Failed);
                warn!(
                    run_id = %run_id,
                    elapsed_ms,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    "Run failed"
                );
            }
        }
        result
    }

    async fn execute(
        &self,
        run_id: &str,
        topic: &Topic,
        metadata: &CurriculumMetadata,
        sources: &[SourceCandidate],
        stage_tx: &watch::Sender<RunStage>,
    ) -> Result<ContentArtifact, RunFailure> {
        let fail = |stage: RunStage, reason: FailureReason| RunFailure::new(run_id, stage, reason);
        let mut timings = Vec::new();

        // ── Relevance ──
        let report = in_stage(
            run_id,
            stage_tx,
            RunStage::Relevance,
            self.timeouts.relevance(),
            &mut timings,
            self.relevance.evaluate(topic, sources),
        )
        .await
        .map_err(|r| fail(RunStage::Relevance, r))?;

        let selected = report.selection_sources(self.relevance.settings().max_sources);
        if selected.is_empty() {
            return Err(fail(RunStage::Relevance, FailureReason::NoRelevantSource));
        }
        if report.relies_on_flagged() {
            warn!(
                run_id,
                flagged = report.flagged.len(),
                used = selected.len(),
                "No source accepted, continuing with sources flagged for manual review"
            );
        }

        // ── Selection ──
        let outcome = in_stage(
            run_id,
            stage_tx,
            RunStage::Selection,
            self.timeouts.selection(),
            &mut timings,
            self.selector.select_all(selected, topic),
        )
        .await
        .map_err(|r| fail(RunStage::Selection, r))?;

        if outcome.total_pages() == 0 {
            let reason = if outcome.all_unavailable() {
                let detail = outcome
                    .sources
                    .iter()
                    .find_map(|s| match &s.status {
                        SourceStatus::Unavailable(reason) => Some(reason.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                FailureReason::DependencyUnavailable {
                    dependency: LITERATURE_CORPUS.into(),
                    reason: detail,
                }
            } else {
                FailureReason::SelectionEmpty
            };
            return Err(fail(RunStage::Selection, reason));
        }

        // ── Generation (validation consumes the stream as it arrives) ──
        stage_tx.send_replace(RunStage::Generation);
        let started = Instant::now();
        let context = self.context.build(outcome.into_pages());
        let memo = PageEmbeddingMemo::new();

        let first = self.attempt(run_id, topic, &context, &memo).await;
        let (session, context) = match first {
            Ok(session) => (session, context),
            Err(AttemptError::Embedder(e)) => {
                return Err(fail(RunStage::Generation, self.embedder_unavailable(e)));
            }
            Err(err) => {
                let shortened = self.context.shortened(&context);
                warn!(
                    run_id,
                    error = %describe(&err),
                    pages = shortened.len(),
                    "Generation failed, retrying with shortened context"
                );
                match self.attempt(run_id, topic, &shortened, &memo).await {
                    Ok(session) => (session, shortened),
                    Err(AttemptError::Embedder(e)) => {
                        return Err(fail(RunStage::Generation, self.embedder_unavailable(e)));
                    }
                    Err(AttemptError::Provider(e)) if e.is_unavailable() => {
                        return Err(fail(
                            RunStage::Generation,
                            FailureReason::DependencyUnavailable {
                                dependency: INFERENCE_ENGINE.into(),
                                reason: e.to_string(),
                            },
                        ));
                    }
                    Err(err) => {
                        return Err(fail(
                            RunStage::Generation,
                            FailureReason::GenerationFailed {
                                reason: describe(&err),
                            },
                        ));
                    }
                }
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        timings.push(StageTiming {
            stage: RunStage::Generation,
            elapsed_ms,
        });
        info!(run_id, stage = %RunStage::Generation, elapsed_ms, "Stage finished");

        // ── Validation ──
        let validated = in_stage(
            run_id,
            stage_tx,
            RunStage::Validation,
            self.timeouts.validation(),
            &mut timings,
            session.finish(),
        )
        .await
        .map_err(|r| fail(RunStage::Validation, r))?
        .map_err(|e| fail(RunStage::Validation, self.embedder_unavailable(e)))?;

        // ── Formatting ──
        let text = in_stage(
            run_id,
            stage_tx,
            RunStage::Formatting,
            self.timeouts.formatting(),
            &mut timings,
            self.formatter
                .format(&validated.annotated_text, topic, metadata),
        )
        .await
        .map_err(|r| fail(RunStage::Formatting, r))?;

        let overall_confidence = validated.overall_confidence();
        Ok(ContentArtifact {
            run_id: run_id.to_string(),
            topic: topic.clone(),
            metadata: metadata.clone(),
            text,
            verdicts: validated.verdicts,
            overall_confidence,
            requires_review: overall_confidence < self.review_threshold,
            sources: report.accepted,
            flagged_sources: report.flagged,
            context_tokens: context.total_tokens(),
            stage_timings: timings,
            generated_at: Utc::now(),
        })
    }

    /// One streamed generation, validated incrementally. Page embeddings are
    /// resolved while the request is being opened.
    async fn attempt(
        &self,
        run_id: &str,
        topic: &Topic,
        context: &GenerationContext,
        memo: &PageEmbeddingMemo,
    ) -> Result<ValidationSession, AttemptError> {
        let work = async {
            let (stream, session) = tokio::join!(
                self.generator.generate(topic, context, &self.template_spec),
                self.validator.session(context, memo),
            );
            let mut session = session.map_err(AttemptError::Embedder)?;
            let mut chunks = stream.map_err(AttemptError::Provider)?;

            while let Some(chunk) = chunks.recv().await {
                let chunk = chunk.map_err(AttemptError::Provider)?;
                session.push(&chunk).await.map_err(AttemptError::Embedder)?;
            }
            if session.received().trim().is_empty() {
                return Err(AttemptError::Provider(ProviderError::MalformedResponse(
                    "empty generation".into(),
                )));
            }
            debug!(run_id, chars = session.received().len(), "Generation stream complete");
            Ok::<_, AttemptError>(session)
        };

        tokio::time::timeout(self.timeouts.generation(), work)
            .await
            .unwrap_or(Err(AttemptError::TimedOut))
    }

    fn embedder_unavailable(&self, error: ProviderError) -> FailureReason {
        FailureReason::DependencyUnavailable {
            dependency: format!("{EMBEDDING_MODEL} ({})", self.validator.embedder_name()),
            reason: error.to_string(),
        }
    }

    /// Run many topics concurrently, bounded by the run limit.
    pub async fn run_batch(&self, requests: &[RunRequest]) -> BatchReport {
        let started = Instant::now();
        let runs = requests.iter().map(|r| async move {
            let t = Instant::now();
            let result = self.run(&r.topic, &r.metadata, &r.sources).await;
            (result, t.elapsed())
        });
        let finished = join_all(runs).await;

        let total_secs = started.elapsed().as_secs_f64();
        let run_secs: f64 = finished.iter().map(|(_, d)| d.as_secs_f64()).sum();
        let results: Vec<_> = finished.into_iter().map(|(r, _)| r).collect();
        let summary = BatchSummary::from_results(&results, total_secs, run_secs);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            total_secs = summary.total_secs,
            "Batch finished"
        );
        BatchReport { results, summary }
    }
}

fn describe(err: &AttemptError) -> String {
    match err {
        AttemptError::Provider(e) | AttemptError::Embedder(e) => e.to_string(),
        AttemptError::TimedOut => "generation timed out".into(),
    }
}

// ── Batch ─────────────────────────────────────────────────────────────────

/// One topic to generate, with its candidate literature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub topic: Topic,
    #[serde(default)]
    pub metadata: CurriculumMetadata,
    pub sources: Vec<SourceCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_secs: f64,
    pub average_secs: f64,
    pub failures: Vec<RunFailure>,
}

impl BatchSummary {
    fn from_results(
        results: &[Result<ContentArtifact, RunFailure>],
        total_secs: f64,
        run_secs: f64,
    ) -> Self {
        let total = results.len();
        let failures: Vec<RunFailure> = results
            .iter()
            .filter_map(|r| r.as_ref().err().cloned())
            .collect();
        let succeeded = total - failures.len();
        let per_run = |v: f64| if total == 0 { 0.0 } else { v / total as f64 };
        Self {
            total,
            succeeded,
            failed: failures.len(),
            success_rate: per_run(succeeded as f64),
            total_secs,
            average_secs: per_run(run_secs),
            failures,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    /// One entry per request, in request order.
    pub results: Vec<Result<ContentArtifact, RunFailure>>,
    pub summary: BatchSummary,
}
