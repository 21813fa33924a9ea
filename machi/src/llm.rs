//! The LLM client collaborator (spec §6.1) — out of this crate's core scope
//! (no concrete provider HTTP client ships here), but the trait the engine
//! is written against, plus a deterministic [`MockLLMClient`] used by the
//! engine's own test suite.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, LlmErrorKind, Result};
use crate::message::Message;
use crate::run::ToolChoice;
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// A tool call as it streams in: `tool_calls` are identified by `index`,
/// never by arrival order (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMToolCallDelta {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Why the model stopped generating (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    /// Anything the provider returns that isn't one of the above; treated
    /// as a terminal, non-successful finish by the response parser.
    Other,
}

/// One partial payload from a streaming LLM response (spec §4.4).
///
/// `content` may be an empty string (a provider emitting an empty delta
/// alongside a finish reason, per spec §9, is a valid chunk — not an error).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<LLMToolCallDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Parameters for a single `generate` call (spec §6.1).
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

/// The external LLM HTTP client collaborator (spec §6.1). The concrete
/// provider adapter (OpenAI, Anthropic, ...) lives outside this crate;
/// implementations MUST map provider errors onto [`AgentError::Llm`].
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Non-streaming call, used by the context manager's summarization step.
    async fn generate(&self, messages: &[Message], options: &GenerateOptions) -> Result<Message>;

    /// Streaming call driving the run engine's turn loop.
    async fn generate_stream(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<LLMChunk>> + Send>>>;

    /// Advisory token count (spec §9: robust to a ±20% estimation error).
    async fn count_tokens(&self, messages: &[Message], model: &str) -> Result<usize>;

    /// Render tool definitions in this provider's wire format.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Value {
        Value::Array(tools.iter().map(ToolDefinition::to_json_schema).collect())
    }
}

/// A scripted, deterministic `LLMClient` for tests (spec §6.1 "reference
/// implementation"). Scripts are keyed by call index: the Nth call to
/// `generate`/`generate_stream` consumes the Nth scripted response, wrapping
/// around if the script is shorter than the number of calls made.
pub struct MockLLMClient {
    scripts: tokio::sync::Mutex<Vec<Vec<LLMChunk>>>,
    call_count: std::sync::atomic::AtomicUsize,
    token_counter: Box<dyn Fn(&[Message]) -> usize + Send + Sync>,
}

impl MockLLMClient {
    /// One script (a sequence of chunks) per `generate_stream` call, consumed
    /// in order.
    #[must_use]
    pub fn new(scripts: Vec<Vec<LLMChunk>>) -> Self {
        Self {
            scripts: tokio::sync::Mutex::new(scripts),
            call_count: std::sync::atomic::AtomicUsize::new(0),
            token_counter: Box::new(|messages| {
                messages.iter().map(|m| m.content.as_text().len() / 4 + 8).sum()
            }),
        }
    }

    #[must_use]
    pub fn with_token_counter(mut self, counter: impl Fn(&[Message]) -> usize + Send + Sync + 'static) -> Self {
        self.token_counter = Box::new(counter);
        self
    }

    /// Append another scripted response to be consumed by a future call.
    pub async fn push_script(&self, script: Vec<LLMChunk>) {
        self.scripts.lock().await.push(script);
    }

    fn next_index(&self) -> usize {
        self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn generate(&self, messages: &[Message], options: &GenerateOptions) -> Result<Message> {
        let chunks = {
            let scripts = self.scripts.lock().await;
            let idx = self.next_index();
            scripts
                .get(idx % scripts.len().max(1))
                .cloned()
                .ok_or_else(|| AgentError::llm(LlmErrorKind::Sdk, "no scripted response available"))?
        };
        let _ = options;
        let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
        let thread_id = messages.first().map_or_else(uuid::Uuid::new_v4, |m| m.thread_id);
        Ok(Message::assistant(thread_id, text))
    }

    async fn generate_stream(
        &self,
        _messages: &[Message],
        _options: &GenerateOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<LLMChunk>> + Send>>> {
        let chunks = {
            let scripts = self.scripts.lock().await;
            let idx = self.next_index();
            scripts
                .get(idx % scripts.len().max(1))
                .cloned()
                .ok_or_else(|| AgentError::llm(LlmErrorKind::Sdk, "no scripted response available"))?
        };
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn count_tokens(&self, messages: &[Message], _model: &str) -> Result<usize> {
        Ok((self.token_counter)(messages))
    }
}

/// A stub provider-format renderer useful in tests that just need a stable
/// `name -> definition` map rather than a real wire payload.
#[must_use]
pub fn tools_by_name(tools: &[ToolDefinition]) -> HashMap<String, &ToolDefinition> {
    tools.iter().map(|t| (t.name.clone(), t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GenerateOptions {
        GenerateOptions {
            model: "mock".to_string(),
            tools: vec![],
            tool_choice: ToolChoice::Auto,
            temperature: 0.7,
            max_tokens: None,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn mock_client_replays_scripted_chunks() {
        let client = MockLLMClient::new(vec![vec![
            LLMChunk {
                content: Some("Hi".to_string()),
                ..Default::default()
            },
            LLMChunk {
                content: Some("!".to_string()),
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            },
        ]]);
        let thread_id = uuid::Uuid::new_v4();
        let messages = vec![Message::user(thread_id, "hi")];
        use futures::StreamExt;
        let mut stream = client.generate_stream(&messages, &options()).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(c) = chunk.unwrap().content {
                text.push_str(&c);
            }
        }
        assert_eq!(text, "Hi!");
    }

    #[tokio::test]
    async fn mock_client_advances_through_consecutive_scripts() {
        let client = MockLLMClient::new(vec![
            vec![LLMChunk {
                content: Some("first".to_string()),
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            }],
            vec![LLMChunk {
                content: Some("second".to_string()),
                finish_reason: Some(FinishReason::Stop),
                ..Default::default()
            }],
        ]);
        let thread_id = uuid::Uuid::new_v4();
        let messages = vec![Message::user(thread_id, "hi")];
        let first = client.generate(&messages, &options()).await.unwrap();
        let second = client.generate(&messages, &options()).await.unwrap();
        assert_eq!(first.content.as_text(), "first");
        assert_eq!(second.content.as_text(), "second");
    }
}
