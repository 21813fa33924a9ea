//! The tool executor (spec §3, §4.5, C5): resolves tool calls against a
//! [`ToolProvider`] and runs them, normalizing every outcome into a
//! [`ToolResult`] so a failing tool body never aborts the run.
//!
//! Concurrency follows the teacher's `Runner::execute_tool_calls` shape:
//! calls are chunked by `max_concurrency` and each chunk is driven with
//! [`futures::future::join_all`], which preserves the original call order
//! in the returned `Vec` regardless of which future in the chunk finishes
//! first.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{Instrument, info_span, warn};

use crate::error::{AgentError, Result};
use crate::message::ToolCall;
use crate::run::ExecutionStrategy;
use crate::tool::{ToolError, ToolProvider, ToolResult};

/// One tool call paired with its outcome, in the order `execute_batch` was
/// called with.
#[derive(Debug, Clone)]
pub struct ToolExecutionRecord {
    pub call: ToolCall,
    pub result: ToolResult,
}

/// Drives tool calls to completion against a [`ToolProvider`] (spec §4.5).
pub struct ToolExecutor {
    provider: Arc<dyn ToolProvider>,
    strategy: ExecutionStrategy,
    max_concurrency: usize,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(provider: Arc<dyn ToolProvider>, strategy: ExecutionStrategy, max_concurrency: usize) -> Self {
        Self {
            provider,
            strategy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Execute one tool call, never returning `Err` for a tool-body failure;
    /// lookup/argument errors are also normalized into a failed
    /// [`ToolResult`] so callers can always append a `role=tool` message.
    pub async fn execute(&self, call: &ToolCall) -> ToolExecutionRecord {
        let span = info_span!(
            "tool",
            tool.name = %call.function.name,
            tool.id = %call.id,
            tool.success = tracing::field::Empty,
        );

        async {
            let result = self.execute_inner(call).await;
            tracing::Span::current().record("tool.success", result.success);
            if !result.success {
                if let Some(err) = &result.error {
                    warn!(error = %err, "tool call failed");
                }
            }
            ToolExecutionRecord {
                call: call.clone(),
                result,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(&self, call: &ToolCall) -> ToolResult {
        let tool = match self.provider.get_tool(&call.function.name).await {
            Ok(Some(tool)) => tool,
            Ok(None) => {
                return ToolResult::err(AgentError::tool_not_found(&call.function.name).to_string());
            }
            Err(err) => return ToolResult::err(err.to_string()),
        };

        let args = match call.parse_arguments() {
            Ok(args) => args,
            Err(err) => {
                let agent_err = AgentError::tool_argument(&call.function.name, err.to_string());
                return ToolResult::err(agent_err.to_string());
            }
        };

        // A panicking tool body must not take the run down with it (spec §4.5).
        let outcome = std::panic::AssertUnwindSafe(tool.call(args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(data)) => ToolResult::ok(data),
            Ok(Err(ToolError::Message(message))) => ToolResult::err(message),
            Ok(Err(ToolError::Json(err))) => ToolResult::err(format!("invalid tool output: {err}")),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                ToolResult::err(
                    AgentError::tool_execution(
                        &call.function.name,
                        crate::error::ToolExecutionErrorKind::Unknown,
                        message,
                    )
                    .to_string(),
                )
            }
        }
    }

    /// Execute a batch of tool calls per [`ExecutionStrategy`] (spec §4.5):
    /// `Sequential` runs one at a time in call order; `Parallel` chunks by
    /// `max_concurrency` and joins each chunk concurrently. Both preserve
    /// the input order in the returned `Vec`.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Result<Vec<ToolExecutionRecord>> {
        match self.strategy {
            ExecutionStrategy::Sequential => {
                let mut records = Vec::with_capacity(calls.len());
                for call in calls {
                    records.push(self.execute(call).await);
                }
                Ok(records)
            }
            ExecutionStrategy::Parallel => {
                let mut records = Vec::with_capacity(calls.len());
                for chunk in calls.chunks(self.max_concurrency) {
                    let futs = chunk.iter().map(|call| self.execute(call));
                    records.extend(futures::future::join_all(futs).await);
                }
                Ok(records)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolDefinition, Toolset};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Add;

    #[async_trait]
    impl Tool for Add {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("add", "add two numbers")
        }

        async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(serde_json::json!(a + b))
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("boom", "always fails")
        }

        async fn call(&self, _args: Value) -> std::result::Result<Value, ToolError> {
            Err(ToolError::message("kaboom"))
        }
    }

    struct Slow(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for Slow {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("slow", "sleeps briefly then records completion order")
        }

        async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
            let delay_ms = args["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let order = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "order": order }))
        }
    }

    fn provider() -> Arc<dyn ToolProvider> {
        let mut set = Toolset::new("default", "default", "default toolset");
        set.add_tool(Box::new(Add));
        set.add_tool(Box::new(Failing));
        Arc::new(set)
    }

    #[tokio::test]
    async fn successful_call_yields_ok_result() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "add", r#"{"a":2,"b":3}"#);
        let record = executor.execute(&call).await;
        assert!(record.result.success);
        assert_eq!(record.result.data, serde_json::json!(5));
    }

    #[tokio::test]
    async fn unknown_tool_name_is_normalized_not_panicked() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "missing", "{}");
        let record = executor.execute(&call).await;
        assert!(!record.result.success);
        assert!(record.result.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_normalized_not_panicked() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "add", "not json");
        let record = executor.execute(&call).await;
        assert!(!record.result.success);
    }

    // spec §4.5: lookup (step 1) happens before argument parsing (step 2), so
    // an unknown tool name with malformed arguments is reported as
    // tool_not_found, not invalid_arguments.
    #[tokio::test]
    async fn unknown_tool_wins_over_malformed_arguments() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "missing", "not json");
        let record = executor.execute(&call).await;
        assert!(!record.result.success);
        assert!(record.result.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn failing_tool_body_is_normalized_not_propagated() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "boom", "{}");
        let record = executor.execute(&call).await;
        assert!(!record.result.success);
        assert_eq!(record.result.error.as_deref(), Some("kaboom"));
    }

    struct Panics;

    #[async_trait]
    impl Tool for Panics {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("panics", "always panics")
        }

        async fn call(&self, _args: Value) -> std::result::Result<Value, ToolError> {
            panic!("tool body exploded");
        }
    }

    #[tokio::test]
    async fn panicking_tool_body_is_caught_not_propagated() {
        let mut set = Toolset::new("default", "default", "default toolset");
        set.add_tool(Box::new(Panics));
        let provider: Arc<dyn ToolProvider> = Arc::new(set);
        let executor = ToolExecutor::new(provider, ExecutionStrategy::Sequential, 1);
        let call = ToolCall::new("c1", "panics", "{}");
        let record = executor.execute(&call).await;
        assert!(!record.result.success);
    }

    #[tokio::test]
    async fn batch_preserves_call_order_regardless_of_completion_order() {
        let mut set = Toolset::new("default", "default", "default toolset");
        let counter = Arc::new(AtomicUsize::new(0));
        set.add_tool(Box::new(Slow(counter)));
        let provider: Arc<dyn ToolProvider> = Arc::new(set);
        let executor = ToolExecutor::new(provider, ExecutionStrategy::Parallel, 4);

        let calls = vec![
            ToolCall::new("c1", "slow", r#"{"delay_ms":30}"#),
            ToolCall::new("c2", "slow", r#"{"delay_ms":10}"#),
            ToolCall::new("c3", "slow", r#"{"delay_ms":20}"#),
        ];
        let records = executor.execute_batch(&calls).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.call.id.clone()).collect();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string(), "c3".to_string()]);
    }

    #[tokio::test]
    async fn sequential_strategy_runs_one_at_a_time_in_order() {
        let executor = ToolExecutor::new(provider(), ExecutionStrategy::Sequential, 1);
        let calls = vec![
            ToolCall::new("c1", "add", r#"{"a":1,"b":1}"#),
            ToolCall::new("c2", "add", r#"{"a":2,"b":2}"#),
        ];
        let records = executor.execute_batch(&calls).await.unwrap();
        assert_eq!(records[0].result.data, serde_json::json!(2));
        assert_eq!(records[1].result.data, serde_json::json!(4));
    }
}
