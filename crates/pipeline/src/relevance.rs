//! Relevance evaluation: which candidate sources are worth reading for a topic.
//!
//! Each source first goes through a deterministic lexical title match. A
//! decisive result (clear match or clear non-match) becomes an `ALGORITHMIC`
//! verdict with no inference call. Everything else is judged by the LLM in a
//! single batched request per run. If that request fails, ambiguous sources
//! are flagged for manual inclusion with a neutral score and are not cached.
//! Flagged sources are never accepted, but they feed page selection when
//! nothing else was.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use coursegen_cache::{Computed, Fingerprint, ResultCache, namespaces};
use coursegen_config::AppConfig;
use coursegen_core::{
    Message, Provider, ProviderError, ProviderRequest, RelevanceVerdict, SourceCandidate, Topic,
    VerdictMethod,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::text;

/// Thresholds and limits for relevance evaluation.
#[derive(Debug, Clone)]
pub struct RelevanceSettings {
    /// Verdicts must score strictly above this to be accepted.
    pub threshold: f32,
    /// Lexical confidence above which no LLM judgment is requested.
    pub algorithmic_confidence: f32,
    /// Score given to ambiguous sources when the LLM judgment fails.
    pub ambiguous_score: f32,
    pub max_sources: usize,
    pub llm_timeout: Duration,
    pub cache_ttl: Duration,
}

impl RelevanceSettings {
    /// The LLM judgment gets three quarters of the stage budget so the
    /// flagged fallback is produced before the stage deadline.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            threshold: config.pipeline.relevance_threshold,
            algorithmic_confidence: config.pipeline.algorithmic_confidence,
            ambiguous_score: config.pipeline.ambiguous_score,
            max_sources: config.pipeline.max_sources,
            llm_timeout: config.timeouts.relevance().mul_f32(0.75),
            cache_ttl: config.cache.ttl(),
        }
    }
}

impl Default for RelevanceSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Result of evaluating a set of candidate sources.
#[derive(Debug, Clone, Default)]
pub struct RelevanceReport {
    /// At most `max_sources` verdicts above threshold, best first.
    pub accepted: Vec<RelevanceVerdict>,
    /// Ambiguous sources the LLM could not judge.
    pub flagged: Vec<RelevanceVerdict>,
    /// Inference calls made by this evaluation (0 or 1).
    pub inference_calls: usize,
}

impl RelevanceReport {
    /// The sources page selection should read.
    ///
    /// Accepted sources when there are any. Otherwise the flagged sources (up
    /// to `max_sources`, in id order), so an unusable LLM judgment degrades
    /// the run to manual review instead of failing it. Empty only when no
    /// source was accepted or flagged.
    pub fn selection_sources(&self, max_sources: usize) -> &[RelevanceVerdict] {
        if !self.accepted.is_empty() {
            &self.accepted
        } else {
            &self.flagged[..self.flagged.len().min(max_sources)]
        }
    }

    /// Whether selection runs on flagged sources only.
    pub fn relies_on_flagged(&self) -> bool {
        self.accepted.is_empty() && !self.flagged.is_empty()
    }
}

/// Lexical title match: `(score, confidence)`.
///
/// Confidence is `|2·score − 1|`: decisive matches and decisive non-matches
/// are both confident, a half-match is not.
pub fn lexical_match(topic: &Topic, source: &SourceCandidate) -> (f32, f32) {
    let query = text::tokenize(&topic.theme);
    let title = text::tokenize(&source.title);
    let score = text::match_score(&query, &title).clamp(0.0, 1.0);
    (score, (2.0 * score - 1.0).abs())
}

type Labels = Result<HashMap<String, bool>, String>;

pub struct RelevanceEvaluator {
    provider: Arc<dyn Provider>,
    cache: Arc<ResultCache>,
    model: String,
    settings: RelevanceSettings,
}

impl RelevanceEvaluator {
    pub fn new(
        provider: Arc<dyn Provider>,
        cache: Arc<ResultCache>,
        model: impl Into<String>,
        settings: RelevanceSettings,
    ) -> Self {
        Self {
            provider,
            cache,
            model: model.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &RelevanceSettings {
        &self.settings
    }

    fn fingerprint(topic: &Topic, source: &SourceCandidate) -> Fingerprint {
        Fingerprint::builder(namespaces::RELEVANCE)
            .text("theme", &topic.theme)
            .text("discipline", &topic.discipline)
            .exact("degree", topic.degree.as_str())
            .exact("source", &source.id)
            .finish()
    }

    /// Score every candidate and return the accepted and flagged verdicts.
    ///
    /// Never fails: an unusable LLM judgment degrades to flagged verdicts.
    pub async fn evaluate(&self, topic: &Topic, sources: &[SourceCandidate]) -> RelevanceReport {
        let mut verdicts: Vec<RelevanceVerdict> = Vec::with_capacity(sources.len());
        let mut ambiguous: Vec<&SourceCandidate> = Vec::new();

        for source in sources {
            let key = Self::fingerprint(topic, source);
            let (score, confidence) = lexical_match(topic, source);

            if confidence > self.settings.algorithmic_confidence {
                let Ok(verdict) = self
                    .cache
                    .get_or_compute(&key, self.settings.cache_ttl, || async {
                        Ok::<_, Infallible>(Computed::Store(RelevanceVerdict {
                            source: source.clone(),
                            score,
                            method: VerdictMethod::Algorithmic,
                            flagged_for_manual_inclusion: false,
                        }))
                    })
                    .await;
                verdicts.push(verdict);
                continue;
            }

            match self.cache.get::<RelevanceVerdict>(&key).await {
                Some(cached) => {
                    debug!(source_id = %source.id, "Relevance verdict served from cache");
                    verdicts.push(cached);
                }
                None => ambiguous.push(source),
            }
        }

        let mut inference_calls = 0;
        if !ambiguous.is_empty() {
            let (judged, calls) = self.judge_ambiguous(topic, &ambiguous).await;
            verdicts.extend(judged);
            inference_calls = calls;
        }

        let report = self.rank(verdicts, inference_calls);
        info!(
            theme = %topic.theme,
            candidates = sources.len(),
            accepted = report.accepted.len(),
            flagged = report.flagged.len(),
            inference_calls = report.inference_calls,
            "Relevance evaluated"
        );
        report
    }

    /// One LLM call shared by every ambiguous source of this run. Each source
    /// still goes through the cache, so a concurrent run computing the same
    /// key is waited on rather than duplicated.
    async fn judge_ambiguous(
        &self,
        topic: &Topic,
        ambiguous: &[&SourceCandidate],
    ) -> (Vec<RelevanceVerdict>, usize) {
        let batch: OnceCell<Labels> = OnceCell::new();

        let lookups = ambiguous.iter().map(|source| {
            let key = Self::fingerprint(topic, source);
            let batch = &batch;
            async move {
                let Ok(verdict) = self
                    .cache
                    .get_or_compute(&key, self.settings.cache_ttl, || async {
                        let labels = batch
                            .get_or_init(|| self.request_labels(topic, ambiguous))
                            .await;
                        Ok::<_, Infallible>(self.verdict_from_labels(source, labels))
                    })
                    .await;
                verdict
            }
        });

        let verdicts = futures::future::join_all(lookups).await;
        let calls = usize::from(batch.initialized());
        (verdicts, calls)
    }

    fn verdict_from_labels(
        &self,
        source: &SourceCandidate,
        labels: &Labels,
    ) -> Computed<RelevanceVerdict> {
        match labels.as_ref().map(|l| l.get(&source.id).copied()) {
            Ok(Some(relevant)) => Computed::Store(RelevanceVerdict {
                source: source.clone(),
                score: if relevant { 1.0 } else { 0.0 },
                method: VerdictMethod::LlmFallback,
                flagged_for_manual_inclusion: false,
            }),
            Ok(None) | Err(_) => {
                warn!(source_id = %source.id, "No usable LLM label, flagging for manual inclusion");
                Computed::Transient(RelevanceVerdict {
                    source: source.clone(),
                    score: self.settings.ambiguous_score,
                    method: VerdictMethod::LlmFallback,
                    flagged_for_manual_inclusion: true,
                })
            }
        }
    }

    async fn request_labels(&self, topic: &Topic, sources: &[&SourceCandidate]) -> Labels {
        let mut request = ProviderRequest::new(&self.model, judgment_prompt(topic, sources));
        request.json_mode = true;
        request.temperature = 0.0;
        request.max_tokens = Some(256);

        debug!(sources = sources.len(), "Requesting batched relevance judgment");
        let response =
            match tokio::time::timeout(self.settings.llm_timeout, self.provider.complete(request))
                .await
            {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    warn!(error = %e, "Relevance judgment failed");
                    return Err(e.to_string());
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.settings.llm_timeout.as_millis() as u64,
                        "Relevance judgment timed out"
                    );
                    return Err(ProviderError::Timeout("relevance judgment".into()).to_string());
                }
            };

        parse_labels(&response.message.content).map_err(|e| {
            warn!(error = %e, "Unparseable relevance judgment");
            e
        })
    }

    fn rank(&self, verdicts: Vec<RelevanceVerdict>, inference_calls: usize) -> RelevanceReport {
        let (mut flagged, judged): (Vec<_>, Vec<_>) = verdicts
            .into_iter()
            .partition(|v| v.flagged_for_manual_inclusion);
        flagged.sort_by(|a, b| a.source.id.cmp(&b.source.id));

        let mut accepted: Vec<RelevanceVerdict> = judged
            .into_iter()
            .filter(|v| v.score > self.settings.threshold)
            .collect();
        accepted.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source.id.cmp(&b.source.id))
        });
        accepted.truncate(self.settings.max_sources);

        RelevanceReport {
            accepted,
            flagged,
            inference_calls,
        }
    }
}

fn judgment_prompt(topic: &Topic, sources: &[&SourceCandidate]) -> Vec<Message> {
    let listing = sources
        .iter()
        .map(|s| {
            if s.authors.is_empty() {
                format!("- {}: {}", s.id, s.title)
            } else {
                format!("- {}: {} ({})", s.id, s.title, s.authors)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    vec![
        Message::system(
            "You decide whether textbooks are suitable sources for a university lecture. \
             Answer with a JSON object that maps every source id to 1 if the book covers the \
             topic and 0 otherwise. Output nothing but the JSON object.",
        ),
        Message::user(format!(
            "Topic: {}\nDiscipline: {}\nDegree: {}\n\nSources:\n{}",
            topic.theme, topic.discipline, topic.degree, listing
        )),
    ]
}

/// Parse `{"<id>": 0|1, ...}`, optionally wrapped in `{"labels": {...}}` or
/// surrounded by prose. Booleans and "0"/"1" strings are accepted.
pub fn parse_labels(content: &str) -> Result<HashMap<String, bool>, String> {
    let start = content.find('{').ok_or("no JSON object in response")?;
    let end = content.rfind('}').ok_or("no JSON object in response")?;
    if end < start {
        return Err("no JSON object in response".into());
    }

    let value: serde_json::Value =
        serde_json::from_str(&content[start..=end]).map_err(|e| e.to_string())?;
    let object = match value.get("labels") {
        Some(inner) if inner.is_object() => inner,
        _ => &value,
    };
    let object = object.as_object().ok_or("labels are not an object")?;

    let mut labels = HashMap::with_capacity(object.len());
    for (id, label) in object {
        let relevant = match label {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|x| x >= 0.5),
            serde_json::Value::String(s) => matches!(s.trim(), "1" | "true" | "yes"),
            _ => return Err(format!("unexpected label for {id}: {label}")),
        };
        labels.insert(id.clone(), relevant);
    }
    Ok(labels)
}
