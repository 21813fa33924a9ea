//! Convenience re-exports of the types most callers need.
//!
//! ```rust
//! use machi::prelude::*;
//!
//! let config = RunConfig {
//!     model: Some("gpt-4o".to_string()),
//!     ..RunConfig::default()
//! };
//! let thread = Thread::new(None);
//! let user_message = Message::user(thread.id, "Say hi.");
//! ```

pub use crate::context_manager::ContextManager;
pub use crate::coordinator::{Coordinator, EventStream};
pub use crate::delegation::{DelegationTool, EventForwarder, DELEGATION_TOOL_NAME};
pub use crate::engine::{CancellationToken, Engine};
pub use crate::error::{AgentError, ErrorDetail, LlmErrorKind, Result, ToolExecutionErrorKind};
pub use crate::event::{Envelope, EventType};
pub use crate::llm::{FinishReason, GenerateOptions, LLMChunk, LLMClient, LLMToolCallDelta, MockLLMClient};
pub use crate::message::{
    Content, ContentPart, Message, MessageAttributes, MessageOrder, MessageQuery, MessageStore,
    MessageUpdate, Role, ToolCall, ToolCallFunction,
};
pub use crate::openapi::{ConnectorOptions, OpenApiConnector, OpenApiParser, Operation, Parameter, ParameterLocation};
pub use crate::response_parser::{ParseEvent, ResponseParser, XmlScannerConfig};
pub use crate::run::{
    AgentRun, ApiKeyLocation, AuthSpec, ContextManagerConfig, ExecutionStrategy, ResponseProcessorConfig,
    RunConfig, RunConfigOverrides, RunStatus, RunStore, ToolChoice, ToolExecutorConfig,
};
pub use crate::store::{InMemoryMessageStore, InMemoryRunStore, InMemoryThreadStore};
pub use crate::thread::{Pagination, Thread, ThreadFilter, ThreadStore, ThreadUpdate};
pub use crate::tool::{
    is_valid_tool_name, sanitize_tool_name, Aggregator, BoxedTool, DynTool, NamedToolset, Tool, ToolDefinition,
    ToolError, ToolParameter, ToolProvider, ToolResult, Toolset,
};
pub use crate::tool_executor::{ToolExecutionRecord, ToolExecutor};
pub use crate::toolset_orchestrator::{orchestrate, ToolProviderSourceConfig, ToolsetCreationStrategy};
pub use crate::usage::{CompletionTokensDetails, PromptTokensDetails, Usage, UsageTracker};
