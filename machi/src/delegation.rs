//! The delegation tool: `delegateToSpecialistAgent`, a tool whose body spins
//! up an isolated sub-[`Engine`] against a single specialist [`Toolset`] and
//! returns its final answer.
//!
//! The sub-run gets its own thread, message store, and run record so its
//! messages never bleed into the parent conversation; only the final
//! assistant text crosses back as a [`crate::tool::ToolResult`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::engine::{CancellationToken, Engine};
use crate::event::{Envelope, EventType};
use crate::llm::LLMClient;
use crate::message::{Message, MessageQuery, Role};
use crate::run::{AgentRun, RunConfig};
use crate::store::in_memory::in_memory_stores;
use crate::thread::Thread;
use crate::tool::{NamedToolset, Tool, ToolDefinition, ToolError, ToolParameter, ToolProvider};

/// Name of the delegation tool.
pub const DELEGATION_TOOL_NAME: &str = "delegateToSpecialistAgent";

/// Sub-run continuation budget subtracted from the parent's
/// `max_tool_call_continuations`, leaving headroom so a runaway specialist
/// cannot burn the parent's entire continuation budget.
const CONTINUATION_DECREMENT: usize = 2;

/// A sink callback forwarding every sub-run event to the parent stream, with
/// `parent_step_id` preserved, so a caller streaming the parent run also
/// sees the specialist's turn-by-turn progress.
pub type EventForwarder = Arc<dyn Fn(Envelope) + Send + Sync>;

/// The `delegateToSpecialistAgent` tool.
///
/// Holds the full set of available specialist [`NamedToolset`]s keyed by id
/// (whether backed by a static [`Toolset`] or a connector such as
/// `crate::openapi::OpenApiConnector`), the shared LLM client used to drive
/// the sub-run, and the parent run's continuation-adjusted config. One
/// instance is constructed per parent run.
pub struct DelegationTool {
    toolsets: HashMap<String, Arc<NamedToolset>>,
    llm: Arc<dyn LLMClient>,
    parent_config: RunConfig,
    parent_step_id: Uuid,
    forwarder: Option<EventForwarder>,
}

impl DelegationTool {
    #[must_use]
    pub fn new(
        toolsets: Vec<Arc<NamedToolset>>,
        llm: Arc<dyn LLMClient>,
        parent_config: RunConfig,
        parent_step_id: Uuid,
    ) -> Self {
        Self {
            toolsets: toolsets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            llm,
            parent_config,
            parent_step_id,
            forwarder: None,
        }
    }

    /// Install a callback invoked with every sub-run event before it
    /// completes.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: EventForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// The `specialistId` enum: the current set of toolset ids.
    #[must_use]
    pub fn specialist_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.toolsets.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Tool for DelegationTool {
    fn definition(&self) -> ToolDefinition {
        let ids = self.specialist_ids().join(", ");
        ToolDefinition::new(
            DELEGATION_TOOL_NAME,
            "Delegate a sub-task to a specialist agent restricted to one toolset",
        )
        .with_parameter(ToolParameter::new(
            "specialistId",
            "string",
            format!("id of the specialist toolset to delegate to, one of: {ids}"),
            true,
        ))
        .with_parameter(ToolParameter::new(
            "subTaskDescription",
            "string",
            "description of the sub-task for the specialist to complete",
            true,
        ))
        .with_parameter(ToolParameter::new(
            "requiredOutputFormat",
            "string",
            "optional instruction on how the specialist's final answer should be formatted",
            false,
        ))
    }

    async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
        let specialist_id = args
            .get("specialistId")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::message("'specialistId' is required"))?
            .to_string();
        let sub_task = args
            .get("subTaskDescription")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::message("'subTaskDescription' is required"))?
            .to_string();
        let required_format = args.get("requiredOutputFormat").and_then(Value::as_str);

        let Some(toolset) = self.toolsets.get(&specialist_id) else {
            return Ok(serde_json::to_value(crate::tool::ToolResult::err(format!(
                "unknown specialist '{specialist_id}'"
            )))
            .map_err(ToolError::from)?);
        };

        let tool_defs = toolset.get_tools().await.map_err(|err| ToolError::message(err.to_string()))?;
        let mut system_prompt = format!(
            "You are a specialist agent named '{}'. {}\n\nAvailable tools:\n{}",
            toolset.name,
            toolset.description,
            tool_defs
                .iter()
                .map(|d| format!("- {}: {}", d.name, d.description))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        if let Some(format) = required_format {
            system_prompt.push_str(&format!("\n\nRequired output format: {format}"));
        }

        let sub_config = RunConfig {
            system_prompt: Some(system_prompt),
            max_tool_call_continuations: self
                .parent_config
                .max_tool_call_continuations
                .saturating_sub(CONTINUATION_DECREMENT),
            ..self.parent_config.clone()
        };

        let (threads, messages, runs) = in_memory_stores();
        let sub_thread = Thread::new(None);
        let sub_thread_id = sub_thread.id;
        let sub_run = AgentRun::new(sub_thread_id, "worker", sub_config);
        let sub_run_id = sub_run.id;

        let provider: Arc<dyn crate::tool::ToolProvider> = toolset.clone();
        let engine = Engine::new(self.llm.clone(), provider, threads, messages.clone(), runs);

        if let Some(forwarder) = &self.forwarder {
            forwarder(Envelope::new(
                EventType::AgentSubAgentInvocationStarted,
                sub_run_id,
                sub_thread_id,
                serde_json::json!({
                    "specialist_id": specialist_id,
                    "parent_step_id": self.parent_step_id,
                }),
            ));
        }

        let stream = engine.run_streamed(
            sub_thread,
            sub_run,
            vec![Message::user(sub_thread_id, sub_task)],
            CancellationToken::new(),
        );
        futures::pin_mut!(stream);

        let mut sub_run_failed = false;
        let mut failure_message = None;
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    sub_run_failed = true;
                    failure_message = Some(err.to_string());
                    break;
                }
            };
            if matches!(
                event.event_type,
                EventType::ThreadRunFailed | EventType::AgentRunStatusChanged
            ) {
                let status = event.data.get("status").and_then(Value::as_str);
                if event.event_type == EventType::ThreadRunFailed
                    || status == Some("cancelled")
                {
                    sub_run_failed = true;
                    failure_message = event
                        .data
                        .get("code")
                        .and_then(Value::as_str)
                        .map(ToString::to_string);
                }
            }
            if let Some(forwarder) = &self.forwarder {
                let mut enveloped = event;
                if let Value::Object(map) = &mut enveloped.data {
                    map.insert(
                        "parent_step_id".to_string(),
                        Value::String(self.parent_step_id.to_string()),
                    );
                }
                forwarder(enveloped);
            }
        }

        if let Some(forwarder) = &self.forwarder {
            forwarder(Envelope::new(
                EventType::AgentSubAgentInvocationCompleted,
                sub_run_id,
                sub_thread_id,
                serde_json::json!({
                    "specialist_id": specialist_id,
                    "parent_step_id": self.parent_step_id,
                    "success": !sub_run_failed,
                }),
            ));
        }

        let sub_messages = messages
            .get(sub_thread_id, MessageQuery::default())
            .await
            .map_err(|err| ToolError::message(err.to_string()))?;
        let final_text: String = sub_messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_text())
            .unwrap_or_default();

        let result = if sub_run_failed {
            crate::tool::ToolResult::err(
                failure_message.unwrap_or_else(|| "sub-run did not complete successfully".to_string()),
            )
            .with_attributes(serde_json::json!({
                "sub_run_id": sub_run_id,
                "specialist_id": specialist_id,
            }))
        } else {
            crate::tool::ToolResult::ok(Value::String(final_text)).with_attributes(serde_json::json!({
                "sub_run_id": sub_run_id,
                "specialist_id": specialist_id,
            }))
        };

        Ok(serde_json::to_value(result).map_err(ToolError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FinishReason, LLMChunk, MockLLMClient};
    use crate::run::RunConfig;
    use crate::tool::ToolError as TErr;

    struct Add;

    #[async_trait]
    impl Tool for Add {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("add", "add two numbers")
        }

        async fn call(&self, args: Value) -> std::result::Result<Value, TErr> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(serde_json::json!(a + b))
        }
    }

    fn math_toolset() -> Arc<NamedToolset> {
        let mut set = crate::tool::Toolset::new("math", "Math specialist", "handles arithmetic");
        set.add_tool(Box::new(Add));
        Arc::new(NamedToolset::from(set))
    }

    fn configured_parent() -> RunConfig {
        RunConfig {
            model: Some("mock-model".to_string()),
            ..RunConfig::default()
        }
    }

    // S5: delegation produces a single final-answer ToolResult and leaves the
    // sub-thread isolated from the parent.
    #[tokio::test]
    async fn delegation_returns_final_answer_and_isolates_sub_thread() {
        let script = vec![vec![LLMChunk {
            content: Some("20".to_string()),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }]];
        let llm: Arc<dyn LLMClient> = Arc::new(MockLLMClient::new(script));
        let tool = DelegationTool::new(vec![math_toolset()], llm, configured_parent(), Uuid::new_v4());

        let output = tool
            .call(serde_json::json!({
                "specialistId": "math",
                "subTaskDescription": "Compute (2+3)*4",
            }))
            .await
            .unwrap();

        assert_eq!(output["success"], true);
        assert_eq!(output["data"], "20");
        assert!(output["attributes"]["sub_run_id"].is_string());
        assert_eq!(output["attributes"]["specialist_id"], "math");
    }

    #[tokio::test]
    async fn unknown_specialist_id_fails_without_spawning_a_sub_run() {
        let llm: Arc<dyn LLMClient> = Arc::new(MockLLMClient::new(vec![]));
        let tool = DelegationTool::new(vec![math_toolset()], llm, RunConfig::default(), Uuid::new_v4());

        let output = tool
            .call(serde_json::json!({
                "specialistId": "unknown",
                "subTaskDescription": "whatever",
            }))
            .await
            .unwrap();

        assert_eq!(output["success"], false);
        assert!(output["error"].as_str().unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn sub_run_events_are_forwarded_with_parent_step_id() {
        let script = vec![vec![LLMChunk {
            content: Some("done".to_string()),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }]];
        let llm: Arc<dyn LLMClient> = Arc::new(MockLLMClient::new(script));
        let parent_step_id = Uuid::new_v4();
        let forwarded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let forwarded_clone = forwarded.clone();
        let tool = DelegationTool::new(vec![math_toolset()], llm, configured_parent(), parent_step_id)
            .with_forwarder(Arc::new(move |event| {
                forwarded_clone.lock().unwrap().push(event);
            }));

        let _ = tool
            .call(serde_json::json!({
                "specialistId": "math",
                "subTaskDescription": "anything",
            }))
            .await
            .unwrap();

        let events = forwarded.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events
            .iter()
            .all(|e| e.data["parent_step_id"] == parent_step_id.to_string()));
    }

    // spec §6.3: agent.sub_agent.invocation.started/completed bracket the
    // sub-run's own forwarded events.
    #[tokio::test]
    async fn sub_agent_invocation_started_and_completed_are_emitted() {
        let script = vec![vec![LLMChunk {
            content: Some("done".to_string()),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }]];
        let llm: Arc<dyn LLMClient> = Arc::new(MockLLMClient::new(script));
        let forwarded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let forwarded_clone = forwarded.clone();
        let tool = DelegationTool::new(vec![math_toolset()], llm, configured_parent(), Uuid::new_v4())
            .with_forwarder(Arc::new(move |event| {
                forwarded_clone.lock().unwrap().push(event);
            }));

        let _ = tool
            .call(serde_json::json!({
                "specialistId": "math",
                "subTaskDescription": "anything",
            }))
            .await
            .unwrap();

        let events = forwarded.lock().unwrap();
        assert_eq!(events.first().unwrap().event_type, EventType::AgentSubAgentInvocationStarted);
        assert_eq!(events.last().unwrap().event_type, EventType::AgentSubAgentInvocationCompleted);
        assert_eq!(events.last().unwrap().data["success"], true);
    }

    #[test]
    fn continuation_budget_is_decremented_for_the_sub_run() {
        let parent_config = RunConfig {
            max_tool_call_continuations: 5,
            ..RunConfig::default()
        };
        assert_eq!(
            parent_config
                .max_tool_call_continuations
                .saturating_sub(CONTINUATION_DECREMENT),
            3
        );
    }
}
