//! Streamed lecture generation from a budgeted context.

use std::sync::Arc;

use coursegen_config::AppConfig;
use coursegen_core::{
    GenerationContext, Message, Provider, ProviderError, ProviderRequest, Topic,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiving half of a generation: text chunks in emission order.
///
/// Dropping it cancels the forwarding task and the provider stream behind it.
pub type TextReceiver = mpsc::Receiver<Result<String, ProviderError>>;

/// Sections the generated lecture must contain, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    pub sections: Vec<String>,
}

impl TemplateSpec {
    pub fn new<S: Into<String>>(sections: impl IntoIterator<Item = S>) -> Self {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
        }
    }

    /// The standard lecture layout.
    pub fn lecture() -> Self {
        Self::new([
            "Learning objectives",
            "Outline",
            "Body",
            "Conclusions",
            "Self-check questions",
            "References",
        ])
    }
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self::lecture()
    }
}

const SYSTEM_PROMPT: &str = "You write university lecture material strictly from the \
source excerpts you are given. You never invent facts that are not in the excerpts.";

pub struct ContentGenerator {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    channel_capacity: usize,
}

impl ContentGenerator {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.3,
            max_output_tokens: 4096,
            channel_capacity: 32,
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, config: &AppConfig) -> Self {
        Self {
            provider,
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_output_tokens: config.provider.max_output_tokens,
            channel_capacity: config.pipeline.chunk_channel_capacity,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Build the single structured request for a topic.
    pub fn build_request(
        &self,
        topic: &Topic,
        context: &GenerationContext,
        spec: &TemplateSpec,
    ) -> ProviderRequest {
        let sections = spec
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Write a lecture on \"{theme}\" for the {degree} level of the discipline \"{discipline}\".\n\n\
             Structure the lecture with exactly these sections, each under a markdown heading:\n\
             {sections}\n\n\
             Rules:\n\
             - Every factual sentence in the body must end with the citation marker of the excerpt it \
             comes from, written exactly as in the excerpt header, for example [src:<source_id>, p.<page>].\n\
             - Put one fact in each sentence.\n\
             - Use only the excerpts below. If they do not cover something, leave it out.\n\
             - The references section lists the sources you cited.\n\n\
             Source excerpts:\n\n{context}",
            theme = topic.theme,
            degree = topic.degree,
            discipline = topic.discipline,
            context = context.render(),
        );

        let mut request = ProviderRequest::new(
            self.model.clone(),
            vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
        );
        request.temperature = self.temperature;
        request.max_tokens = Some(self.max_output_tokens);
        request
    }

    /// Start a streamed generation.
    ///
    /// Errors only if the request could not be started; failures mid-stream
    /// arrive as an `Err` item on the receiver, after which it closes.
    pub async fn generate(
        &self,
        topic: &Topic,
        context: &GenerationContext,
        spec: &TemplateSpec,
    ) -> Result<TextReceiver, ProviderError> {
        let request = self.build_request(topic, context, spec);
        info!(
            provider = self.provider.name(),
            model = %self.model,
            context_pages = context.len(),
            context_tokens = context.total_tokens(),
            "Starting generation"
        );
        let mut upstream = self.provider.stream(request).await?;

        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Generation receiver dropped, cancelling");
                        return;
                    }
                    item = upstream.recv() => item,
                };
                match item {
                    None => return,
                    Some(Ok(chunk)) => {
                        if let Some(text) = chunk.content.filter(|t| !t.is_empty())
                            && tx.send(Ok(text)).await.is_err()
                        {
                            return;
                        }
                        if chunk.done {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Drain a generation into one string, stopping at the first error.
pub async fn collect_text(mut rx: TextReceiver) -> Result<String, ProviderError> {
    let mut text = String::new();
    while let Some(chunk) = rx.recv().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, StreamScript};
    use coursegen_core::{
        AcademicDegree, ContextPage, PageContent, PageRange, RelevanceSignal,
    };
    use std::time::Duration;

    fn context() -> GenerationContext {
        let page = PageContent {
            source_id: "b1".into(),
            source_title: "Термодинамика".into(),
            range: PageRange::single(12),
            text: "Энтропия изолированной системы не убывает.".into(),
            signal: RelevanceSignal {
                toc_match: Some(1.0),
                keyword_density: None,
                composite: 0.4,
            },
            source_rank: 0,
        };
        GenerationContext::new(vec![ContextPage { page, tokens: 30 }], 100, 0).unwrap()
    }

    fn topic() -> Topic {
        Topic::new("Энтропия", AcademicDegree::Bachelor, "physics")
    }

    #[test]
    fn request_embeds_sections_markers_and_context() {
        let generator = ContentGenerator::new(Arc::new(ScriptedProvider::new()), "mock");
        let request = generator.build_request(&topic(), &context(), &TemplateSpec::lecture());
        let prompt = &request.messages[1].content;

        assert!(prompt.contains("6. References"));
        assert!(prompt.contains("[src:<source_id>, p.<page>]"));
        assert!(prompt.contains("[src:b1, p.12] Термодинамика\nЭнтропия изолированной системы не убывает."));
        assert_eq!(request.max_tokens, Some(4096));
    }

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_stream(StreamScript::chunks(["Энтропия ", "растёт", ".", ""]));
        let generator = ContentGenerator::new(provider.clone(), "mock");

        let rx = generator
            .generate(&topic(), &context(), &TemplateSpec::default())
            .await
            .unwrap();

        assert_eq!(collect_text(rx).await.unwrap(), "Энтропия растёт.");
        assert_eq!(provider.stream_calls(), 1);
    }

    #[tokio::test]
    async fn mid_stream_error_is_forwarded() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_stream(StreamScript::ChunksThenError(
            vec!["partial".into()],
            ProviderError::StreamInterrupted("reset".into()),
        ));
        let generator = ContentGenerator::new(provider, "mock");

        let rx = generator
            .generate(&topic(), &context(), &TemplateSpec::default())
            .await
            .unwrap();

        assert!(matches!(
            collect_text(rx).await,
            Err(ProviderError::StreamInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn failed_start_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_stream(StreamScript::Fail(ProviderError::Network("refused".into())));
        let generator = ContentGenerator::new(provider, "mock");

        let result = generator
            .generate(&topic(), &context(), &TemplateSpec::default())
            .await;
        assert!(matches!(result, Err(ProviderError::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_receiver_cancels_provider_stream() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_stream(StreamScript::Hang);
        let generator = ContentGenerator::new(provider.clone(), "mock");

        let rx = generator
            .generate(&topic(), &context(), &TemplateSpec::default())
            .await
            .unwrap();
        drop(rx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(provider.cancelled_streams(), 1);
    }
}
