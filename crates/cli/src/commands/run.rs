//! `coursegen run` and `coursegen batch`: generate lecture content.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use coursegen_cache::ResultCache;
use coursegen_config::AppConfig;
use coursegen_core::{
    ContentArtifact, CurriculumMetadata, LiteratureCorpus, SourceCandidate, Topic,
};
use coursegen_pipeline::{PipelineCoordinator, RunRequest};
use coursegen_providers::build_from_config;
use serde::Deserialize;
use tracing::warn;

use super::corpus::FileCorpus;

/// A bibliographic reference from the curriculum, resolved against the corpus.
#[derive(Debug, Clone, Deserialize)]
pub struct LiteratureRef {
    pub title: String,
    #[serde(default)]
    pub authors: String,
}

/// One topic as written in an input file. Candidates may be given directly
/// as corpus sources, as literature references, or both.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicRequest {
    pub topic: Topic,
    #[serde(default)]
    pub metadata: CurriculumMetadata,
    #[serde(default)]
    pub sources: Vec<SourceCandidate>,
    #[serde(default)]
    pub literature: Vec<LiteratureRef>,
}

/// Resolve literature references to corpus sources. Unresolved references
/// are reported and skipped; duplicates are dropped.
pub async fn resolve(
    request: TopicRequest,
    corpus: &dyn LiteratureCorpus,
) -> anyhow::Result<RunRequest> {
    let mut sources = request.sources;
    for reference in &request.literature {
        match corpus.search(&reference.title, &reference.authors).await? {
            Some(found) => sources.push(found),
            None => warn!(
                title = %reference.title,
                authors = %reference.authors,
                "Literature reference not found in corpus"
            ),
        }
    }
    let mut seen = HashSet::new();
    sources.retain(|s| seen.insert(s.id.clone()));

    Ok(RunRequest {
        topic: request.topic,
        metadata: request.metadata,
        sources,
    })
}

fn build_pipeline(config: &AppConfig, corpus: Arc<dyn LiteratureCorpus>) -> PipelineCoordinator {
    let backends = build_from_config(config);
    let cache = Arc::new(ResultCache::in_memory(
        config.cache.max_entries,
        config.cache.ttl(),
    ));
    PipelineCoordinator::new(backends.provider, backends.embedder, corpus, cache, config)
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn print_artifact(artifact: &ContentArtifact) {
    println!("{}", artifact.text);
    println!();
    println!("   Run:         {}", artifact.run_id);
    println!(
        "   Sources:     {}",
        artifact
            .sources
            .iter()
            .map(|v| format!("{} ({:.2}, {:?})", v.source.id, v.score, v.method))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "   Claims:      {} ({} need review)",
        artifact.verdicts.len(),
        artifact.unsupported_claims().count()
    );
    println!("   Confidence:  {:.2}", artifact.overall_confidence);
    for flag in artifact.quality_flags() {
        println!("   ⚠️  {flag:?}");
    }
}

pub async fn run(
    config: &AppConfig,
    input: &Path,
    corpus_path: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let corpus = Arc::new(FileCorpus::load(corpus_path).await?);
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let request: TopicRequest =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", input.display()))?;
    let request = resolve(request, corpus.as_ref()).await?;

    let pipeline = build_pipeline(config, corpus);
    match pipeline
        .run(&request.topic, &request.metadata, &request.sources)
        .await
    {
        Ok(artifact) => {
            if let Some(path) = output {
                write_json(path, &artifact).await?;
            }
            print_artifact(&artifact);
            Ok(())
        }
        Err(failure) => {
            eprintln!("{}", serde_json::to_string_pretty(&failure)?);
            Err(failure.into())
        }
    }
}

pub async fn batch(
    config: &AppConfig,
    input: &Path,
    corpus_path: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let corpus = Arc::new(FileCorpus::load(corpus_path).await?);
    let raw = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let topics: Vec<TopicRequest> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", input.display()))?;

    let mut requests = Vec::with_capacity(topics.len());
    for topic in topics {
        requests.push(resolve(topic, corpus.as_ref()).await?);
    }

    let pipeline = build_pipeline(config, corpus);
    let report = pipeline.run_batch(&requests).await;
    if let Some(path) = output {
        write_json(path, &report).await?;
    }

    let s = &report.summary;
    println!("📚 Batch finished");
    println!("   Topics:      {}", s.total);
    println!("   Succeeded:   {}", s.succeeded);
    println!("   Failed:      {}", s.failed);
    println!("   Success:     {:.0}%", s.success_rate * 100.0);
    println!("   Total time:  {:.1}s (avg {:.1}s per topic)", s.total_secs, s.average_secs);
    for failure in &s.failures {
        println!("   ❌ {failure}");
    }
    Ok(())
}
