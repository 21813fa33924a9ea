//! Message types for the agent run engine.
//!
//! These are the durable, storage-facing shapes (spec §3), distinct from the
//! wire-format types the LLM client collaborator in [`crate::llm`] deals
//! with. A [`Message`] is what a [`crate::thread::Thread`] owns and what
//! [`crate::store::MessageStore`] persists.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message within a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image {
        image_reference: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// Message content: either plain text or an ordered sequence of typed parts.
///
/// `null` (represented here as `Content::None`) is permitted for an assistant
/// message that only carries tool calls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    #[default]
    None,
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Text(s) => s.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    /// Render all text parts concatenated, for logging/delegation capture.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(ContentPart::as_text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn push_str(&mut self, fragment: &str) {
        match self {
            Self::None => *self = Self::Text(fragment.to_string()),
            Self::Text(s) => s.push_str(fragment),
            Self::Parts(parts) => parts.push(ContentPart::text(fragment)),
        }
    }
}

/// The function payload of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Raw JSON document as emitted by the model; not assumed well-formed.
    pub arguments: String,
}

/// A tool call requested by the model (spec §3 `ToolCall`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "kind", default = "default_tool_call_kind")]
    pub kind: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse `arguments` as JSON. Callers (the tool executor) treat a parse
    /// failure as `AgentError::ToolArgument`, never a panic.
    pub fn parse_arguments(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.function.arguments)
    }
}

/// Free-form attributes carried alongside the structural fields of a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
}

/// A single message within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub role: Role,
    pub content: Content,
    pub attributes: MessageAttributes,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Message {
    fn now() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64())
    }

    #[must_use]
    pub fn new(thread_id: Uuid, role: Role, content: Content) -> Self {
        let now = Self::now();
        Self {
            id: Uuid::new_v4(),
            thread_id,
            role,
            content,
            attributes: MessageAttributes::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn user(thread_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::User, Content::text(text))
    }

    #[must_use]
    pub fn system(thread_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::System, Content::text(text))
    }

    #[must_use]
    pub fn assistant(thread_id: Uuid, text: impl Into<String>) -> Self {
        Self::new(thread_id, Role::Assistant, Content::text(text))
    }

    /// An in-progress assistant message shell with no content yet.
    #[must_use]
    pub fn assistant_shell(thread_id: Uuid) -> Self {
        Self::new(thread_id, Role::Assistant, Content::None)
    }

    #[must_use]
    pub fn assistant_with_tool_calls(thread_id: Uuid, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::new(thread_id, Role::Assistant, Content::None);
        message.attributes.tool_calls = Some(tool_calls);
        message
    }

    /// `role=tool` message; invariant: MUST carry `tool_call_id` and string content.
    #[must_use]
    pub fn tool_result(thread_id: Uuid, tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(thread_id, Role::Tool, Content::text(content));
        message.attributes.tool_call_id = Some(tool_call_id.into());
        message
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.attributes
            .tool_calls
            .as_ref()
            .is_some_and(|calls| !calls.is_empty())
    }

    pub fn touch(&mut self) {
        self.updated_at = Self::now();
    }
}

/// Ordering for `MessageStore::get` (spec §6.2). Default is ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageOrder {
    #[default]
    Ascending,
    Descending,
}

/// Query options for `MessageStore::get` (spec §6.2).
///
/// `after` is strict `>`, `before` is strict `<`, both compared against
/// `created_at`.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub order: MessageOrder,
}

/// Patch applied by `MessageStore::update`.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<Content>,
    pub attributes: Option<MessageAttributes>,
}

/// Persistence contract for messages (spec §6.2).
///
/// Messages are append-only within a thread (spec §3); `update` is confined
/// to an assistant message's `content`/`attributes` during streaming
/// assembly (the engine's own shell-patching, never a client-facing edit).
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn add(&self, message: Message) -> crate::error::Result<Message>;
    async fn get(
        &self,
        thread_id: Uuid,
        query: MessageQuery,
    ) -> crate::error::Result<Vec<Message>>;
    async fn update(&self, id: Uuid, patch: MessageUpdate) -> crate::error::Result<Message>;
    async fn delete(&self, id: Uuid) -> crate::error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_requires_tool_call_id() {
        let thread_id = Uuid::new_v4();
        let msg = Message::tool_result(thread_id, "call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.attributes.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.content.as_text(), "42");
    }

    #[test]
    fn assistant_shell_has_no_content_until_filled() {
        let thread_id = Uuid::new_v4();
        let mut msg = Message::assistant_shell(thread_id);
        assert!(msg.content.is_empty());
        msg.content.push_str("Hi");
        msg.content.push_str("!");
        assert_eq!(msg.content.as_text(), "Hi!");
    }

    #[test]
    fn tool_call_arguments_parse_as_json() {
        let call = ToolCall::new("t1", "add", "{\"a\":2,\"b\":3}");
        let parsed = call.parse_arguments().unwrap();
        assert_eq!(parsed["a"], 2);
    }

    #[test]
    fn tool_call_bad_arguments_fail_to_parse_without_panic() {
        let call = ToolCall::new("t1", "add", "not json");
        assert!(call.parse_arguments().is_err());
    }
}
