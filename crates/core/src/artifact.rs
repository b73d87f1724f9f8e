//! Verdicts, claims, and the final content artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::curriculum::{CurriculumMetadata, SourceCandidate, Topic};

// ── Relevance ─────────────────────────────────────────────────────────────

/// Which strategy produced a relevance verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictMethod {
    /// Deterministic lexical match, no inference call.
    Algorithmic,
    /// Batched LLM judgment for sources the lexical matcher was unsure about.
    LlmFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub source: SourceCandidate,
    /// Relevance in [0, 1].
    pub score: f32,
    pub method: VerdictMethod,
    /// Set when the LLM judgment was unavailable and the score is a placeholder.
    #[serde(default)]
    pub flagged_for_manual_inclusion: bool,
}

// ── Claims & validation ───────────────────────────────────────────────────

/// An inline `[src:<id>, p.<page>]` marker parsed from generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub page: String,
}

/// An atomic factual statement extracted from generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Position in document order.
    pub index: usize,
    /// Claim text with citation markers stripped.
    pub text: String,
    /// Byte range of the full sentence (markers included) in the generated text.
    pub span: std::ops::Range<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<Citation>,
}

/// Points at the context page that best supports a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRef {
    pub source_id: String,
    pub page: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub claim: Claim,
    pub supported: bool,
    /// Maximum cosine similarity between the claim and any context page.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_match: Option<PageRef>,
}

// ── Run lifecycle ─────────────────────────────────────────────────────────

/// Pipeline coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    Relevance,
    Selection,
    Generation,
    Validation,
    Formatting,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Relevance => "relevance",
            Self::Selection => "selection",
            Self::Generation => "generation",
            Self::Validation => "validation",
            Self::Formatting => "formatting",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: RunStage,
    pub elapsed_ms: u64,
}

/// Quality flags attached to a successful artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Aggregate claim confidence fell below the review threshold.
    LowConfidenceContent,
    /// The LLM could not judge at least one ambiguous source. When no source
    /// was accepted, the flagged sources supplied the pages.
    ManualSourceReview,
}

// ── Artifact ──────────────────────────────────────────────────────────────

/// The validated, formatted, cited output of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentArtifact {
    pub run_id: String,
    pub topic: Topic,
    pub metadata: CurriculumMetadata,
    /// Formatted text; unsupported claims carry inline review markers.
    pub text: String,
    /// Per-claim audit trail in document order.
    pub verdicts: Vec<ValidationVerdict>,
    /// Mean of claim confidences (0.0 when no claims were found).
    pub overall_confidence: f32,
    pub requires_review: bool,
    /// Accepted sources, best first.
    pub sources: Vec<RelevanceVerdict>,
    /// Ambiguous sources that could not be judged and need a human decision.
    /// Pages come from these when `sources` is empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flagged_sources: Vec<RelevanceVerdict>,
    pub context_tokens: usize,
    pub stage_timings: Vec<StageTiming>,
    pub generated_at: DateTime<Utc>,
}

impl ContentArtifact {
    pub fn quality_flags(&self) -> Vec<QualityFlag> {
        let mut flags = Vec::new();
        if self.requires_review {
            flags.push(QualityFlag::LowConfidenceContent);
        }
        if !self.flagged_sources.is_empty() {
            flags.push(QualityFlag::ManualSourceReview);
        }
        flags
    }

    pub fn unsupported_claims(&self) -> impl Iterator<Item = &ValidationVerdict> {
        self.verdicts.iter().filter(|v| !v.supported)
    }
}
