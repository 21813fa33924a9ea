//! Tool trait and definitions for agent tool-calling (spec §3, §4.3, §4.5).
//!
//! `ToolDefinition`/`ToolParameter` are what gets handed to
//! `LLMClient::format_tools`; `ToolResult` is what a tool body returns and
//! what the [`crate::tool_executor`] normalizes every invocation into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod toolset;

pub use toolset::{Aggregator, NamedToolset, ToolProvider, Toolset};

/// A single parameter of a [`ToolDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub primitive_type: String,
    pub description: String,
    pub required: bool,
    /// Optional JSON-Schema fragment, used verbatim when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ToolParameter {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        primitive_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            primitive_type: primitive_type.into(),
            description: description.into(),
            required,
            schema: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    fn json_schema_fragment(&self) -> Value {
        if let Some(schema) = &self.schema {
            return schema.clone();
        }
        serde_json::json!({
            "type": self.primitive_type,
            "description": self.description,
        })
    }
}

/// A named capability exposed to the model (spec §3 `ToolDefinition`).
///
/// Name constraint per spec §3/§6.1: 1-64 characters from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// `true` iff `name` matches `[A-Za-z0-9_-]{1,64}` (spec §3, invariant 5 of §8).
    #[must_use]
    pub fn has_valid_name(&self) -> bool {
        is_valid_tool_name(&self.name)
    }

    /// Render as a JSON-Schema `{type:"object", properties, required}` object,
    /// the shape `format_tools` wraps per provider.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.json_schema_fragment());
            if param.required {
                required.push(param.name.clone());
            }
        }
        required.sort();
        serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }
}

/// `true` iff `name` is 1-64 characters drawn from `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Sanitize an arbitrary identifier (e.g. an OpenAPI `operationId`) into a
/// valid tool name by replacing illegal bytes with `_` and truncating to 64
/// characters.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = if sanitized.is_empty() {
        "tool".to_string()
    } else {
        sanitized
    };
    sanitized.chars().take(64).collect()
}

/// The outcome of invoking a tool (spec §3 `ToolResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

impl ToolResult {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            attributes: None,
        }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
            attributes: None,
        }
    }

    #[must_use]
    pub fn err_with_data(message: impl Into<String>, partial_data: Value) -> Self {
        Self {
            success: false,
            data: partial_data,
            error: Some(message.into()),
            attributes: None,
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Render for feeding back to the model as a `role=tool` message body.
    #[must_use]
    pub fn to_content_string(&self) -> String {
        if self.success {
            serde_json::to_string(&self.data).unwrap_or_default()
        } else {
            self.error
                .clone()
                .unwrap_or_else(|| "tool error".to_string())
        }
    }
}

/// Errors a tool body can surface; normalized by the executor into a
/// [`ToolResult`], never allowed to crash the run (spec §4.5).
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Message(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// A tool body. Strongly typed; erased to [`DynTool`] for storage in a
/// [`Toolset`]/[`ToolProvider`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

/// Object-safe wrapper dispatched on by name (spec §4.5 tool executor).
pub type BoxedTool = Box<dyn DynTool>;

#[async_trait]
pub trait DynTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        Tool::call(self, args).await
    }
}

impl fmt::Debug for dyn DynTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynTool")
            .field("name", &self.definition().name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "Echo back the input")
                .with_parameter(ToolParameter::new("text", "string", "text to echo", true))
        }

        async fn call(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    #[test]
    fn valid_tool_names() {
        assert!(is_valid_tool_name("add"));
        assert!(is_valid_tool_name("get_weather-v2"));
        assert!(!is_valid_tool_name(""));
        assert!(!is_valid_tool_name("has space"));
        assert!(!is_valid_tool_name(&"a".repeat(65)));
    }

    #[test]
    fn sanitize_replaces_illegal_bytes() {
        assert_eq!(sanitize_tool_name("GET /pets/{id}"), "GET__pets__id_");
    }

    #[test]
    fn to_json_schema_sorts_required() {
        let def = ToolDefinition::new("t", "desc")
            .with_parameter(ToolParameter::new("b", "string", "b", true))
            .with_parameter(ToolParameter::new("a", "string", "a", true));
        let schema = def.to_json_schema();
        assert_eq!(schema["required"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn dyn_tool_dispatch_works() {
        let tool: BoxedTool = Box::new(Echo);
        let result = tool.call(serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(result["text"], "hi");
        assert_eq!(tool.definition().name, "echo");
    }

    #[test]
    fn tool_result_to_content_string_on_success() {
        let result = ToolResult::ok(serde_json::json!(5));
        assert_eq!(result.to_content_string(), "5");
    }

    #[test]
    fn tool_result_to_content_string_on_failure() {
        let result = ToolResult::err("tool_not_found");
        assert_eq!(result.to_content_string(), "tool_not_found");
    }
}
