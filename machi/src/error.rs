//! Error types for the agent run engine.
//!
//! `AgentError` realizes the taxonomy every component maps its failures onto:
//! configuration/validation problems at construction time, LLM/tool/storage
//! failures at run time, and the two run-engine-specific terminal conditions
//! (context overflow, continuation limit). `.code()` gives the stable string
//! that is persisted to `AgentRun::last_error`.

use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Sub-kind of an [`AgentError::Llm`] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LlmErrorKind {
    #[error("api")]
    Api,
    #[error("rate_limit")]
    RateLimit,
    #[error("authentication")]
    Authentication,
    #[error("invalid_request")]
    InvalidRequest,
    #[error("sdk")]
    Sdk,
    #[error("network")]
    Network,
    #[error("timeout")]
    Timeout,
}

/// Sub-kind of an [`AgentError::ToolExecution`] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ToolExecutionErrorKind {
    #[error("http")]
    Http,
    #[error("auth")]
    Auth,
    #[error("timeout")]
    Timeout,
    #[error("unknown")]
    Unknown,
}

/// The main error type for agent run operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or invalid static config (no model, bad OpenAPI spec, ...).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Malformed input to a public API surface.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Error from the LLM client collaborator.
    #[error("llm error ({kind}): {message}")]
    Llm { kind: LlmErrorKind, message: String },

    /// Unknown tool name requested by the model.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// A tool call's `arguments` string did not parse as JSON.
    #[error("invalid tool arguments for '{tool_name}': {message}")]
    ToolArgument { tool_name: String, message: String },

    /// A tool body failed (network, auth, timeout, or otherwise).
    #[error("tool execution error ({kind}) in '{tool_name}': {message}")]
    ToolExecution {
        tool_name: String,
        kind: ToolExecutionErrorKind,
        message: String,
    },

    /// Persistence failure in `ThreadStore`/`MessageStore`/`RunStore`.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// The context manager could not fit the assembled input in budget.
    #[error("context overflow: assembled input of {tokens} tokens exceeds max_input_tokens ({limit})")]
    ContextOverflow { tokens: usize, limit: usize },

    /// Cooperative cancellation was observed at a suspension point.
    #[error("run cancelled")]
    Cancelled,

    /// The run's `expires_at` timer fired before it reached a terminal state.
    #[error("run expired")]
    Expired,

    /// `max_tool_call_continuations` was exceeded.
    #[error("continuation limit exceeded ({max})")]
    ContinuationLimitExceeded { max: usize },
}

impl AgentError {
    /// A stable machine-readable code, suitable for `AgentRun.last_error.code`.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Validation { .. } => "validation_error",
            Self::Llm { .. } => "llm_error",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::ToolArgument { .. } => "tool_argument_error",
            Self::ToolExecution { .. } => "tool_execution_error",
            Self::Storage { .. } => "storage_error",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::ContinuationLimitExceeded { .. } => "continuation_limit_exceeded",
        }
    }

    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new LLM error.
    #[must_use]
    pub fn llm(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self::Llm {
            kind,
            message: message.into(),
        }
    }

    /// Create a new tool-not-found error.
    #[must_use]
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound { name: name.into() }
    }

    /// Create a new tool-argument error.
    #[must_use]
    pub fn tool_argument(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolArgument {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a new tool-execution error.
    #[must_use]
    pub fn tool_execution(
        tool_name: impl Into<String>,
        kind: ToolExecutionErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ToolExecutionErrorKind::Timeout
        } else {
            ToolExecutionErrorKind::Http
        };
        Self::tool_execution("http", kind, err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            message: err.to_string(),
        }
    }
}

/// The `{code, message, details?}` shape persisted to `AgentRun.last_error`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&AgentError> for ErrorDetail {
    fn from(err: &AgentError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        let err = AgentError::tool_not_found("add");
        assert_eq!(err.code(), "tool_not_found");
    }

    #[test]
    fn error_detail_captures_message() {
        let err = AgentError::ContinuationLimitExceeded { max: 10 };
        let detail = ErrorDetail::from(&err);
        assert_eq!(detail.code, "continuation_limit_exceeded");
        assert!(detail.message.contains("10"));
    }

    #[test]
    fn reqwest_timeout_maps_to_tool_execution_timeout() {
        // constructed indirectly: ensure variant shape compiles and Display works
        let err = AgentError::tool_execution("http", ToolExecutionErrorKind::Timeout, "timed out");
        assert_eq!(err.code(), "tool_execution_error");
        assert!(err.to_string().contains("timeout"));
    }
}
