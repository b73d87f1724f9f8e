//! A literature corpus read from JSON files.
//!
//! The path is either a directory holding one `*.json` file per source, or a
//! single JSON file holding an array of sources:
//!
//! ```json
//! [{ "id": "b1", "title": "Термодинамика", "authors": "Кириллин В. А.",
//!    "pages": [{ "number": 1, "text": "..." }],
//!    "toc": [{ "title": "Глава 1", "start_page": 1, "end_page": 12 }] }]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use coursegen_cache::normalize_text;
use coursegen_core::{CorpusError, LiteratureCorpus, Page, SourceCandidate, TocEntry};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub toc: Vec<TocEntry>,
}

impl SourceRecord {
    fn candidate(&self) -> SourceCandidate {
        let mut candidate = SourceCandidate::new(&self.id, &self.title, &self.authors);
        candidate.year = self.year;
        candidate.publisher = self.publisher.clone();
        candidate
    }
}

pub struct FileCorpus {
    name: String,
    sources: BTreeMap<String, SourceRecord>,
}

impl FileCorpus {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let mut records: Vec<SourceRecord> = Vec::new();
        if path.is_dir() {
            let mut entries = tokio::fs::read_dir(path)
                .await
                .with_context(|| format!("reading corpus directory {}", path.display()))?;
            let mut files = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let file = entry.path();
                if file.extension().is_some_and(|e| e == "json") {
                    files.push(file);
                }
            }
            files.sort();
            for file in files {
                let raw = tokio::fs::read_to_string(&file).await?;
                let record: SourceRecord = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing corpus source {}", file.display()))?;
                records.push(record);
            }
        } else {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading corpus file {}", path.display()))?;
            records = serde_json::from_str(&raw)
                .with_context(|| format!("parsing corpus file {}", path.display()))?;
        }

        let corpus = Self::from_records(path.display().to_string(), records);
        info!(corpus = %corpus.name, sources = corpus.len(), "Corpus loaded");
        Ok(corpus)
    }

    pub fn from_records(name: impl Into<String>, records: Vec<SourceRecord>) -> Self {
        Self {
            name: name.into(),
            sources: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn record(&self, source_id: &str) -> Result<&SourceRecord, CorpusError> {
        self.sources
            .get(source_id)
            .ok_or_else(|| CorpusError::SourceNotFound(source_id.to_string()))
    }
}

/// Surname-ish tokens of an author list ("Кириллин В. А., Сычев В. В.").
fn author_keys(authors: &str) -> Vec<String> {
    normalize_text(authors)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl LiteratureCorpus for FileCorpus {
    fn name(&self) -> &str {
        &self.name
    }

    /// Exact normalized title first, then containment either way. Among
    /// several title matches, one sharing an author surname wins.
    async fn search(
        &self,
        title: &str,
        authors: &str,
    ) -> Result<Option<SourceCandidate>, CorpusError> {
        let wanted = normalize_text(title);
        if wanted.is_empty() {
            return Ok(None);
        }
        let keys = author_keys(authors);

        let mut matches: Vec<(u8, &SourceRecord)> = self
            .sources
            .values()
            .filter_map(|r| {
                let have = normalize_text(&r.title);
                let title_rank = if have == wanted {
                    2
                } else if have.contains(&wanted) || wanted.contains(&have) {
                    1
                } else {
                    return None;
                };
                let author_hit = author_keys(&r.authors).iter().any(|a| keys.contains(a));
                Some((title_rank * 2 + u8::from(author_hit), r))
            })
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
        Ok(matches.first().map(|(_, r)| r.candidate()))
    }

    async fn get_full_text(&self, source_id: &str) -> Result<Vec<Page>, CorpusError> {
        let mut pages = self.record(source_id)?.pages.clone();
        pages.sort_by_key(|p| p.number);
        Ok(pages)
    }

    async fn get_table_of_contents(&self, source_id: &str) -> Result<Vec<TocEntry>, CorpusError> {
        let record = self.record(source_id)?;
        for entry in &record.toc {
            if entry.start_page > entry.end_page {
                return Err(CorpusError::Corrupt {
                    source_id: source_id.to_string(),
                    reason: format!("TOC entry '{}' ends before it starts", entry.title),
                });
            }
        }
        Ok(record.toc.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, title: &str, authors: &str) -> SourceRecord {
        SourceRecord {
            id: id.into(),
            title: title.into(),
            authors: authors.into(),
            year: None,
            publisher: None,
            pages: vec![
                Page {
                    number: 2,
                    text: "Вторая страница.".into(),
                },
                Page {
                    number: 1,
                    text: "Первая страница.".into(),
                },
            ],
            toc: vec![],
        }
    }

    #[tokio::test]
    async fn loads_directory_of_sources() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"id": "b1", "title": "Термодинамика", "authors": "Кириллин В. А.",
            "pages": [{"number": 1, "text": "Энтропия."}],
            "toc": [{"title": "Энтропия", "start_page": 1, "end_page": 1}]}"#;
        std::fs::write(dir.path().join("b1.json"), json).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let corpus = FileCorpus::load(dir.path()).await.unwrap();

        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.get_table_of_contents("b1").await.unwrap().len(), 1);
        assert!(matches!(
            corpus.get_full_text("missing").await,
            Err(CorpusError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn loads_array_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"[{"id": "b1", "title": "A"}, {"id": "b2", "title": "B"}]"#)
            .unwrap();
        let corpus = FileCorpus::load(file.path()).await.unwrap();
        assert_eq!(corpus.len(), 2);
    }

    #[tokio::test]
    async fn pages_come_back_in_order() {
        let corpus = FileCorpus::from_records("t", vec![record("b1", "Термодинамика", "")]);
        let pages = corpus.get_full_text("b1").await.unwrap();
        assert_eq!(pages[0].number, 1);
    }

    #[tokio::test]
    async fn search_prefers_exact_title_then_author() {
        let corpus = FileCorpus::from_records(
            "t",
            vec![
                record("b1", "Техническая термодинамика", "Кириллин В. А."),
                record("b2", "Термодинамика", "Базаров И. П."),
                record("b3", "Термодинамика", "Кириллин В. А."),
            ],
        );

        let hit = corpus.search("термодинамика", "В. А. Кириллин").await.unwrap().unwrap();
        assert_eq!(hit.id, "b3");

        let hit = corpus.search("Техническая  Термодинамика", "").await.unwrap().unwrap();
        assert_eq!(hit.id, "b1");

        assert!(corpus.search("Линейная алгебра", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inverted_toc_range_is_corrupt() {
        let mut r = record("b1", "T", "");
        r.toc.push(TocEntry {
            title: "bad".into(),
            start_page: 5,
            end_page: 2,
        });
        let corpus = FileCorpus::from_records("t", vec![r]);
        assert!(matches!(
            corpus.get_table_of_contents("b1").await,
            Err(CorpusError::Corrupt { .. })
        ));
    }
}
