//! The transport-neutral event envelope emitted by a run (spec §4.10, §6.3).
//!
//! `EventType` is a closed set; the Coordinator and Engine are the only
//! producers. `Envelope::to_sse_line` is the one framing helper a caller
//! outside this crate needs to put the event stream on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event types emitted by a run (spec §4.10). Wire form is the
/// dotted string named in the spec, not a derived `snake_case` rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.run.created")]
    AgentRunCreated,
    #[serde(rename = "agent.run.step.created")]
    AgentRunStepCreated,
    #[serde(rename = "thread.message.created")]
    ThreadMessageCreated,
    #[serde(rename = "thread.message.delta")]
    ThreadMessageDelta,
    #[serde(rename = "thread.message.completed")]
    ThreadMessageCompleted,
    #[serde(rename = "thread.run.step.tool_call.created")]
    ThreadRunStepToolCallCreated,
    #[serde(rename = "thread.run.step.tool_call.completed_by_llm")]
    ThreadRunStepToolCallCompletedByLlm,
    #[serde(rename = "agent.tool.execution.started")]
    AgentToolExecutionStarted,
    #[serde(rename = "agent.tool.execution.completed")]
    AgentToolExecutionCompleted,
    #[serde(rename = "thread.run.requires_action")]
    ThreadRunRequiresAction,
    #[serde(rename = "agent.run.status.changed")]
    AgentRunStatusChanged,
    #[serde(rename = "thread.run.failed")]
    ThreadRunFailed,
    #[serde(rename = "thread.run.completed")]
    ThreadRunCompleted,
    #[serde(rename = "agent.sub_agent.invocation.started")]
    AgentSubAgentInvocationStarted,
    #[serde(rename = "agent.sub_agent.invocation.completed")]
    AgentSubAgentInvocationCompleted,
}

/// `{type, timestamp, run_id, thread_id, data}` (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix-epoch seconds, matching `AgentRun`/`Message`/`Thread` timestamps
    /// elsewhere in this crate (spec §4.10: no new time-formatting dependency).
    pub timestamp: f64,
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn new(event_type: EventType, run_id: Uuid, thread_id: Uuid, data: Value) -> Self {
        Self {
            event_type,
            timestamp: now(),
            run_id,
            thread_id,
            data,
        }
    }

    /// Render as a Server-Sent Events `data: <json>\n\n` line (spec §6.3).
    #[must_use]
    pub fn to_sse_line(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("data: {body}\n\n")
    }
}

fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
