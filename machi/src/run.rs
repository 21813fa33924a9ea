//! Runs: the durable state machine an [`crate::engine::Engine`] drives (spec §3, §4.7).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorDetail;

fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// `AgentRun.status` (spec §3).
///
/// ```text
/// queued --start--> in_progress --> { completed | failed | cancelled | requires_action }
/// requires_action --resume--> in_progress
/// any --timer--> expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

/// `tool_choice` (spec §3 `RunConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Function { name: String },
}

impl Default for ToolChoice {
    fn default() -> Self {
        Self::Auto
    }
}

/// `execution_strategy` for the tool executor (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseProcessorConfig {
    pub enable_native_tool_calling: bool,
    pub enable_xml_tool_calling: bool,
    pub max_xml_tool_calls: usize,
}

impl Default for ResponseProcessorConfig {
    fn default() -> Self {
        Self {
            enable_native_tool_calling: true,
            enable_xml_tool_calling: false,
            max_xml_tool_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolExecutorConfig {
    pub execution_strategy: ExecutionStrategy,
    pub max_concurrency: usize,
}

impl Default for ToolExecutorConfig {
    fn default() -> Self {
        Self {
            execution_strategy: ExecutionStrategy::Sequential,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextManagerConfig {
    pub max_input_tokens: usize,
    pub target_after_truncation: usize,
    pub summary_trigger_ratio: f64,
    pub preserve_system: bool,
    pub preserve_last_n: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: 128_000,
            target_after_truncation: 96_000,
            summary_trigger_ratio: 0.85,
            preserve_system: true,
            preserve_last_n: 6,
        }
    }
}

/// Static or per-run auth override for a tool-provider source (spec §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthSpec {
    None,
    ApiKey {
        location: ApiKeyLocation,
        name: String,
        value: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    OAuth2 {
        access_token: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
    Cookie,
}

/// Full configuration for a run (spec §3 `RunConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// REQUIRED before the first LLM call; enforced at `Engine` construction.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub tool_choice: ToolChoice,
    pub max_tool_call_continuations: usize,
    pub response_processor: ResponseProcessorConfig,
    pub tool_executor: ToolExecutorConfig,
    pub context_manager: ContextManagerConfig,
    pub request_auth_overrides: std::collections::HashMap<String, AuthSpec>,
    pub enable_context_management: bool,
    /// Wall-clock budget for the whole run, seconds from `start_run`/
    /// `resume_run`. `None` means the run never expires on its own (spec §3
    /// "any -> expired by a timer").
    pub run_ttl_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: None,
            system_prompt: None,
            tool_choice: ToolChoice::Auto,
            max_tool_call_continuations: 10,
            response_processor: ResponseProcessorConfig::default(),
            tool_executor: ToolExecutorConfig::default(),
            context_manager: ContextManagerConfig::default(),
            request_auth_overrides: std::collections::HashMap::new(),
            enable_context_management: true,
            run_ttl_secs: None,
        }
    }
}

impl RunConfig {
    /// Apply a partial overlay of caller-supplied overrides on top of this
    /// (typically thread- or deployment-default) base config.
    #[must_use]
    pub fn merged_with(mut self, overrides: RunConfigOverrides) -> Self {
        if let Some(model) = overrides.model {
            self.model = Some(model);
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = Some(max_tokens);
        }
        if let Some(system_prompt) = overrides.system_prompt {
            self.system_prompt = Some(system_prompt);
        }
        if let Some(tool_choice) = overrides.tool_choice {
            self.tool_choice = tool_choice;
        }
        if let Some(max_continuations) = overrides.max_tool_call_continuations {
            self.max_tool_call_continuations = max_continuations;
        }
        if let Some(run_ttl_secs) = overrides.run_ttl_secs {
            self.run_ttl_secs = Some(run_ttl_secs);
        }
        for (provider_id, auth) in overrides.request_auth_overrides {
            self.request_auth_overrides.insert(provider_id, auth);
        }
        self
    }
}

/// All-`Option` overlay applied at `start_run` time on top of a base
/// `RunConfig` (spec §6.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfigOverrides {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tool_call_continuations: Option<usize>,
    pub run_ttl_secs: Option<u64>,
    #[serde(default)]
    pub request_auth_overrides: std::collections::HashMap<String, AuthSpec>,
}

/// The persisted run record (spec §3 `AgentRun`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub agent_type: String,
    pub status: RunStatus,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub expires_at: Option<f64>,
    pub last_error: Option<ErrorDetail>,
    pub config: RunConfig,
    #[serde(default)]
    pub attributes: Value,
}

impl AgentRun {
    #[must_use]
    pub fn new(thread_id: Uuid, agent_type: impl Into<String>, config: RunConfig) -> Self {
        let created_at = now();
        let expires_at = config.run_ttl_secs.map(|ttl| created_at + ttl as f64);
        Self {
            id: Uuid::new_v4(),
            thread_id,
            agent_type: agent_type.into(),
            status: RunStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            expires_at,
            last_error: None,
            config,
            attributes: Value::Null,
        }
    }

    /// Apply a status transition, setting `started_at`/`completed_at` on
    /// first entry per spec §3/§6.2.
    pub fn transition(&mut self, status: RunStatus) {
        if status == RunStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now());
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now());
        }
        self.status = status;
    }
}

/// Persistence contract for runs (spec §6.2).
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: AgentRun) -> crate::error::Result<AgentRun>;
    async fn get(&self, id: Uuid) -> crate::error::Result<Option<AgentRun>>;
    async fn update(&self, run: AgentRun) -> crate::error::Result<AgentRun>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_sets_started_at_once() {
        let mut run = AgentRun::new(Uuid::new_v4(), "default", RunConfig::default());
        assert!(run.started_at.is_none());
        run.transition(RunStatus::InProgress);
        let first = run.started_at;
        assert!(first.is_some());
        run.transition(RunStatus::RequiresAction);
        run.transition(RunStatus::InProgress);
        assert_eq!(run.started_at, first, "started_at is set only on first entry");
    }

    #[test]
    fn transition_sets_completed_at_on_terminal() {
        let mut run = AgentRun::new(Uuid::new_v4(), "default", RunConfig::default());
        run.transition(RunStatus::InProgress);
        assert!(run.completed_at.is_none());
        run.transition(RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn run_ttl_secs_sets_expires_at_relative_to_creation() {
        let config = RunConfig {
            run_ttl_secs: Some(60),
            ..RunConfig::default()
        };
        let run = AgentRun::new(Uuid::new_v4(), "default", config);
        assert_eq!(run.expires_at, Some(run.created_at + 60.0));
    }

    #[test]
    fn no_ttl_leaves_expires_at_unset() {
        let run = AgentRun::new(Uuid::new_v4(), "default", RunConfig::default());
        assert!(run.expires_at.is_none());
    }

    #[test]
    fn merged_overrides_only_touch_set_fields() {
        let base = RunConfig {
            model: Some("gpt-4o".to_string()),
            temperature: 0.2,
            ..RunConfig::default()
        };
        let overrides = RunConfigOverrides {
            temperature: Some(0.9),
            ..Default::default()
        };
        let merged = base.merged_with(overrides);
        assert_eq!(merged.model.as_deref(), Some("gpt-4o"));
        assert_eq!(merged.temperature, 0.9);
    }
}
