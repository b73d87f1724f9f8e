//! OpenAI-compatible provider implementation.
//!
//! Works with Ollama, vLLM, llama.cpp server, OpenRouter, OpenAI, and any
//! endpoint that exposes `/chat/completions`, `/embeddings` and `/models`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - JSON-object response mode for the relevance judgment call
//! - Embeddings
//! - Model listing and health checks

use async_trait::async_trait;
use coursegen_core::error::ProviderError;
use coursegen_core::message::{Message, Role};
use coursegen_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    chunk_capacity: usize,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider with a 120s request timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::with_timeout(name, base_url, api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            chunk_capacity: 64,
        }
    }

    /// Bound on buffered stream chunks before the reader task waits.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity.max(1);
        self
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                },
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        accept_sse: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/{path}", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if accept_sse {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(map_send_error)?;
        check_status(response).await
    }
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();

    if status == 429 {
        return Err(ProviderError::RateLimited {
            retry_after_secs: 5,
        });
    }

    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    if status == 404 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::ModelNotFound(body));
    }

    if status != 200 {
        let error_body = response.text().await.unwrap_or_default();
        warn!(status, body = %error_body, "Provider returned error");
        return Err(ProviderError::ApiError {
            status_code: status,
            message: error_body,
        });
    }

    Ok(response)
}

#[async_trait]
impl coursegen_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);
        debug!(provider = %self.name, model = %request.model, json = request.json_mode, "Sending completion request");

        let response = self.post_json("chat/completions", &body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("No choices in response".into()))?;

        let usage = api_response.usage.map(Usage::from);

        Ok(ProviderResponse {
            message: Message::assistant(choice.message.content.unwrap_or_default()),
            usage,
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post_json("chat/completions", &body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(self.chunk_capacity);
        let provider_name = self.name.clone();

        // Reader task: stops as soon as the receiver is dropped, which drops
        // the response body and closes the HTTP connection.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        SseEvent::Skip => {}
                        SseEvent::Done => {
                            let _ = tx.send(Ok(final_chunk(None))).await;
                            return;
                        }
                        SseEvent::Content(text) => {
                            let chunk = StreamChunk {
                                content: Some(text),
                                done: false,
                                usage: None,
                            };
                            if tx.send(Ok(chunk)).await.is_err() {
                                debug!(provider = %provider_name, "Stream receiver dropped, cancelling");
                                return;
                            }
                        }
                        SseEvent::Usage(usage) => {
                            let _ = tx.send(Ok(final_chunk(Some(usage)))).await;
                            return;
                        }
                        SseEvent::Unparseable(e) => {
                            trace!(
                                provider = %provider_name,
                                data = %line,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(final_chunk(None))).await;
        });

        Ok(rx)
    }

    async fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> std::result::Result<EmbeddingResponse, ProviderError> {
        let body = serde_json::json!({
            "model": request.model,
            "input": request.inputs,
            "encoding_format": "float",
        });

        debug!(
            provider = %self.name,
            model = %request.model,
            count = request.inputs.len(),
            "Sending embedding request"
        );

        let response = self.post_json("embeddings", &body, false).await?;
        let api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ProviderError::MalformedResponse(format!("Failed to parse embedding response: {e}"))
        })?;

        let mut data = api_resp.data;
        data.sort_by_key(|d| d.index);
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if embeddings.len() != request.inputs.len() {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                request.inputs.len(),
                embeddings.len()
            )));
        }

        let usage = api_resp.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: 0,
            total_tokens: u.total_tokens,
        });

        Ok(EmbeddingResponse {
            embeddings,
            model: api_resp.model,
            usage,
        })
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(map_send_error)?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let models = body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(map_send_error)?;

        Ok(response.status().is_success())
    }
}

fn final_chunk(usage: Option<Usage>) -> StreamChunk {
    StreamChunk {
        content: None,
        done: true,
        usage,
    }
}

// --- SSE parsing ---

/// Splits an SSE byte stream into complete lines.
#[derive(Default)]
struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.replace_range(..=line_end, "");
            lines.push(line);
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Skip,
    Done,
    Content(String),
    Usage(Usage),
    Unparseable(String),
}

fn parse_sse_line(line: &str) -> SseEvent {
    // Skip empty lines and SSE comments
    if line.is_empty() || line.starts_with(':') {
        return SseEvent::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => {
            if let Some(usage) = resp.usage {
                return SseEvent::Usage(usage.into());
            }
            match resp.choices.into_iter().next().and_then(|c| c.delta.content) {
                Some(text) if !text.is_empty() => SseEvent::Content(text),
                _ => SseEvent::Skip,
            }
        }
        Err(e) => SseEvent::Unparseable(e.to_string()),
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingApiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_core::Provider;

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url().contains("localhost:11434"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let provider = OpenAiCompatProvider::new("x", "http://host:8000/v1/", "");
        assert_eq!(provider.base_url(), "http://host:8000/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are an editor"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn json_mode_sets_response_format() {
        let mut request = ProviderRequest::new("llama3.1:8b", vec![Message::user("x")]);
        request.json_mode = true;
        request.max_tokens = Some(100);
        let body = OpenAiCompatProvider::request_body(&request, false);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn stream_body_requests_usage() {
        let request = ProviderRequest::new("m", vec![]);
        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("response_format").is_none());
    }

    // --- SSE parsing tests ---

    #[test]
    fn parse_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        assert_eq!(parse_sse_line(line), SseEvent::Content("Hello".into()));
    }

    #[test]
    fn parse_finish_chunk_is_skipped() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_sse_line(line), SseEvent::Skip);
    }

    #[test]
    fn parse_done_and_comments() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Skip);
        assert_eq!(parse_sse_line(""), SseEvent::Skip);
    }

    #[test]
    fn parse_usage_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        match parse_sse_line(line) {
            SseEvent::Usage(u) => {
                assert_eq!(u.prompt_tokens, 10);
                assert_eq!(u.total_tokens, 15);
            }
            other => panic!("expected usage, got {other:?}"),
        }
    }

    #[test]
    fn parse_garbage_is_reported() {
        assert!(matches!(parse_sse_line("data: {not json"), SseEvent::Unparseable(_)));
    }

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::default();
        assert!(buf.push(b"data: {\"cho").is_empty());
        let lines = buf.push(b"ices\":[]}\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"choices\":[]}", "data: [DONE]"]);
    }

    #[test]
    fn parse_embedding_response_out_of_order() {
        let data = r#"{
            "data": [
                {"embedding": [0.4, 0.5], "index": 1},
                {"embedding": [0.1, 0.2], "index": 0}
            ],
            "model": "nomic-embed-text",
            "usage": {"prompt_tokens": 8, "total_tokens": 8}
        }"#;
        let parsed: EmbeddingApiResponse = serde_json::from_str(data).unwrap();
        let mut items = parsed.data;
        items.sort_by_key(|d| d.index);
        assert_eq!(items[0].embedding, vec![0.1, 0.2]);
        assert_eq!(parsed.model, "nomic-embed-text");
    }
}
