//! Scripted collaborators shared by the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coursegen_core::{
    ContextPage, CorpusError, Embedder, GenerationContext, LiteratureCorpus, Message, Page,
    PageContent, PageRange, Provider, ProviderError, ProviderRequest, ProviderResponse,
    RelevanceSignal, SourceCandidate, StreamChunk, TocEntry,
    provider::ChunkReceiver,
};

use crate::context::estimate_page_tokens;

// ── Provider ──────────────────────────────────────────────────────────────

/// What one `stream()` call does.
pub enum StreamScript {
    /// Deliver the chunks, then a final `done` chunk.
    Chunks(Vec<String>),
    /// Deliver the chunks, then fail mid-stream.
    ChunksThenError(Vec<String>, ProviderError),
    /// Fail before the stream starts.
    Fail(ProviderError),
    /// Never produce anything; ends only when the receiver is dropped.
    Hang,
}

impl StreamScript {
    pub fn chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Self::Chunks(chunks.into_iter().map(Into::into).collect())
    }
}

/// A provider that replays queued completions and stream scripts.
///
/// An exhausted queue answers with `NotConfigured`.
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<String, ProviderError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<ProviderRequest>>,
    complete_calls: Mutex<usize>,
    stream_calls: Mutex<usize>,
    cancelled: std::sync::Arc<Mutex<usize>>,
    completion_delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            complete_calls: Mutex::new(0),
            stream_calls: Mutex::new(0),
            cancelled: std::sync::Arc::new(Mutex::new(0)),
            completion_delay: Mutex::new(None),
        }
    }

    pub fn push_completion(&self, response: Result<String, ProviderError>) {
        self.completions.lock().unwrap().push_back(response);
    }

    /// Every `complete()` call sleeps this long before answering.
    pub fn delay_completions(&self, delay: Duration) {
        *self.completion_delay.lock().unwrap() = Some(delay);
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn complete_calls(&self) -> usize {
        *self.complete_calls.lock().unwrap()
    }

    pub fn stream_calls(&self) -> usize {
        *self.stream_calls.lock().unwrap()
    }

    /// Streams whose receiver was dropped before they finished.
    pub fn cancelled_streams(&self) -> usize {
        *self.cancelled.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.complete_calls.lock().unwrap() += 1;
        let delay = *self.completion_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let next = self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("no scripted completion".into())));
        next.map(|content| ProviderResponse {
            message: Message::assistant(content),
            usage: None,
            model,
        })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        *self.stream_calls.lock().unwrap() += 1;
        self.requests.lock().unwrap().push(request);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("no scripted stream".into()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let cancelled = self.cancelled.clone();
        let (chunks, error) = match script {
            StreamScript::Fail(e) => return Err(e),
            StreamScript::Hang => {
                tokio::spawn(async move {
                    tx.closed().await;
                    *cancelled.lock().unwrap() += 1;
                });
                return Ok(rx);
            }
            StreamScript::Chunks(chunks) => (chunks, None),
            StreamScript::ChunksThenError(chunks, e) => (chunks, Some(e)),
        };

        tokio::spawn(async move {
            for text in chunks {
                let chunk = StreamChunk {
                    content: Some(text),
                    done: false,
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    *cancelled.lock().unwrap() += 1;
                    return;
                }
            }
            let last = match error {
                Some(e) => Err(e),
                None => Ok(StreamChunk {
                    content: None,
                    done: true,
                    usage: None,
                }),
            };
            let _ = tx.send(last).await;
        });
        Ok(rx)
    }
}

// ── Corpus ────────────────────────────────────────────────────────────────

pub struct Book {
    id: String,
    title: String,
    pages: Vec<Page>,
    toc: Vec<TocEntry>,
    delay: Option<Duration>,
}

impl Book {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn titled(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }
}

/// A book titled "Book {id}".
pub fn book(id: &str, pages: Vec<Page>, toc: Vec<TocEntry>) -> Book {
    Book {
        id: id.into(),
        title: format!("Book {id}"),
        pages,
        toc,
        delay: None,
    }
}

/// An in-memory corpus with optional per-book load delays.
pub struct MemoryCorpus {
    books: HashMap<String, Book>,
    unavailable: bool,
    full_text_calls: Mutex<usize>,
    toc_calls: Mutex<usize>,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self {
            books: HashMap::new(),
            unavailable: false,
            full_text_calls: Mutex::new(0),
            toc_calls: Mutex::new(0),
        }
    }

    pub fn with_book(mut self, book: Book) -> Self {
        self.books.insert(book.id.clone(), book);
        self
    }

    /// Every call fails as if the corpus service were down.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn full_text_calls(&self) -> usize {
        *self.full_text_calls.lock().unwrap()
    }

    pub fn toc_calls(&self) -> usize {
        *self.toc_calls.lock().unwrap()
    }

    fn check(&self) -> Result<(), CorpusError> {
        if self.unavailable {
            return Err(CorpusError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LiteratureCorpus for MemoryCorpus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(
        &self,
        title: &str,
        _authors: &str,
    ) -> Result<Option<SourceCandidate>, CorpusError> {
        self.check()?;
        let needle = title.to_lowercase();
        let mut hits: Vec<&Book> = self
            .books
            .values()
            .filter(|b| b.title.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits
            .first()
            .map(|b| SourceCandidate::new(b.id.clone(), b.title.clone(), "")))
    }

    async fn get_full_text(&self, source_id: &str) -> Result<Vec<Page>, CorpusError> {
        *self.full_text_calls.lock().unwrap() += 1;
        self.check()?;
        let book = self
            .books
            .get(source_id)
            .ok_or_else(|| CorpusError::SourceNotFound(source_id.into()))?;
        if let Some(delay) = book.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(book.pages.clone())
    }

    async fn get_table_of_contents(&self, source_id: &str) -> Result<Vec<TocEntry>, CorpusError> {
        *self.toc_calls.lock().unwrap() += 1;
        self.check()?;
        self.books
            .get(source_id)
            .map(|b| b.toc.clone())
            .ok_or_else(|| CorpusError::SourceNotFound(source_id.into()))
    }
}

// ── Embedder ──────────────────────────────────────────────────────────────

/// Maps text to a fixed vector by the first rule whose substring it contains.
pub struct RuleEmbedder {
    default: Vec<f32>,
    rules: Vec<(String, Vec<f32>)>,
    failure: Option<ProviderError>,
    batch_calls: Mutex<usize>,
}

impl RuleEmbedder {
    pub fn new(default: Vec<f32>) -> Self {
        Self {
            default,
            rules: Vec::new(),
            failure: None,
            batch_calls: Mutex::new(0),
        }
    }

    pub fn rule(mut self, substring: &str, vector: Vec<f32>) -> Self {
        self.rules.push((substring.into(), vector));
        self
    }

    /// Every call fails with `error`.
    pub fn failing(mut self, error: ProviderError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn batch_calls(&self) -> usize {
        *self.batch_calls.lock().unwrap()
    }
}

#[async_trait]
impl Embedder for RuleEmbedder {
    fn name(&self) -> &str {
        "rules"
    }

    fn dimensions(&self) -> usize {
        self.default.len()
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        *self.batch_calls.lock().unwrap() += 1;
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(texts
            .iter()
            .map(|t| {
                self.rules
                    .iter()
                    .find(|(s, _)| t.contains(s.as_str()))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| self.default.clone())
            })
            .collect())
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────

/// A context holding the given `(source_id, page, text)` pages in order.
pub fn context_of(pages: &[(&str, u32, &str)]) -> GenerationContext {
    let pages: Vec<ContextPage> = pages
        .iter()
        .map(|(id, number, text)| {
            let page = PageContent {
                source_id: (*id).into(),
                source_title: format!("Book {id}"),
                range: PageRange::single(*number),
                text: (*text).into(),
                signal: RelevanceSignal {
                    toc_match: None,
                    keyword_density: Some(0.1),
                    composite: 0.6,
                },
                source_rank: 0,
            };
            let tokens = estimate_page_tokens(&page);
            ContextPage { page, tokens }
        })
        .collect();
    GenerationContext::new(pages, usize::MAX, 0).unwrap()
}
