//! The Run Coordinator / API (spec §4.10, §6.4, C10): the transport-agnostic
//! front door a caller (an HTTP handler, a CLI, a test) drives instead of
//! touching [`crate::engine::Engine`] directly.
//!
//! The coordinator owns run bookkeeping the engine itself does not: creating
//! the `AgentRun` record before the loop starts (so it can emit
//! `agent.run.created`, the one event type the engine never produces itself),
//! tracking a live [`CancellationToken`] per in-flight run so `cancel_run` has
//! something to flip, and rejecting `resume_run` calls against a run that
//! isn't actually paused in `requires_action`. Grounded on spec §4.10/§6.4
//! directly — no teacher or pack file wires a durable run façade in front of
//! an ephemeral agent loop — following the `Arc<dyn Trait>`
//! collaborator-holding struct shape the teacher uses for
//! `SharedChatProvider = Arc<dyn ChatProvider>`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::{CancellationToken, Engine};
use crate::error::{AgentError, Result};
use crate::event::{Envelope, EventType};
use crate::message::{Message, MessageStore};
use crate::run::{AgentRun, RunConfig, RunConfigOverrides, RunStatus, RunStore};
use crate::thread::{Thread, ThreadStore};

/// A caller-facing event stream: an owned, boxed, `Send` stream of
/// [`Envelope`]s. Boxed because `start_run`/`resume_run` chain a synthetic
/// leading event onto the engine's own `impl Stream`, and naming that
/// combinator's type at the call site would leak an implementation detail.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send + 'a>>;

/// Transport-agnostic run façade (spec §4.10 C10).
///
/// One `Coordinator` is built per deployment (or per tenant, if the caller
/// wants isolation at that level) over one [`Engine`] and the same
/// thread/message/run stores the engine was constructed with.
pub struct Coordinator {
    engine: Engine,
    threads: Arc<dyn ThreadStore>,
    messages: Arc<dyn MessageStore>,
    runs: Arc<dyn RunStore>,
    agent_type: String,
    base_config: RunConfig,
    /// Cancellation flags for runs currently being driven by this process.
    /// A run absent from this map is either not yet started, already
    /// terminal, or (after a process restart) orphaned — spec §9 "Run record
    /// versus live state": the in-memory run state does not survive a crash,
    /// only the persisted `AgentRun` record does.
    cancellations: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        engine: Engine,
        threads: Arc<dyn ThreadStore>,
        messages: Arc<dyn MessageStore>,
        runs: Arc<dyn RunStore>,
        agent_type: impl Into<String>,
        base_config: RunConfig,
    ) -> Self {
        Self {
            engine,
            threads,
            messages,
            runs,
            agent_type: agent_type.into(),
            base_config,
            cancellations: RwLock::new(HashMap::new()),
        }
    }

    /// `start_run(thread_id, user_message, config_overrides?)` (spec §4.10,
    /// §6.4). Creates the `AgentRun` record in `queued`, then hands off to
    /// the engine's turn loop, which transitions it to `in_progress` as its
    /// first act.
    pub async fn start_run(
        &self,
        thread_id: Uuid,
        user_message: Message,
        overrides: RunConfigOverrides,
    ) -> Result<(Uuid, EventStream<'_>)> {
        let thread = self
            .threads
            .get(thread_id)
            .await?
            .ok_or_else(|| AgentError::validation(format!("thread {thread_id} not found")))?;

        let config = self.base_config.clone().merged_with(overrides);
        let run = AgentRun::new(thread_id, self.agent_type.clone(), config);
        let run = self.runs.create(run).await?;
        let run_id = run.id;

        let cancellation = CancellationToken::new();
        self.cancellations.write().await.insert(run_id, cancellation.clone());
        Self::spawn_expiry_timer(&run, cancellation.clone());

        let created = Envelope::new(
            EventType::AgentRunCreated,
            run_id,
            thread_id,
            json!({"agent_type": run.agent_type}),
        );
        let tail = self.engine.run_streamed(thread, run, vec![user_message], cancellation);
        let stream = futures::stream::once(async move { Ok(created) }).chain(tail);
        Ok((run_id, Box::pin(stream)))
    }

    /// `resume_run(run_id, tool_outputs)` (spec §4.10, §6.4). Valid only from
    /// `requires_action` — a run stuck there on `limit_exceeded` can also be
    /// resumed; the engine simply re-enters the loop and will hit the same
    /// ceiling again unless the caller raised it via a fresh
    /// `RunConfigOverrides` on the next `start_run` instead.
    pub async fn resume_run(&self, run_id: Uuid, tool_outputs: Vec<Message>) -> Result<EventStream<'_>> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| AgentError::validation(format!("run {run_id} not found")))?;

        if run.status != RunStatus::RequiresAction {
            return Err(AgentError::validation(format!(
                "run {run_id} cannot be resumed from status {:?}",
                run.status
            )));
        }

        let thread = self
            .threads
            .get(run.thread_id)
            .await?
            .ok_or_else(|| AgentError::validation(format!("thread {} not found", run.thread_id)))?;

        let cancellation = CancellationToken::new();
        self.cancellations.write().await.insert(run_id, cancellation.clone());
        Self::spawn_expiry_timer(&run, cancellation.clone());

        Ok(Box::pin(self.engine.run_streamed(thread, run, tool_outputs, cancellation)))
    }

    /// `cancel_run(run_id)` (spec §4.10, §6.4). Cooperative: flips the flag
    /// the engine checks at its next suspension point (spec §5); does not
    /// forcibly terminate anything. Errors if the run isn't currently being
    /// driven by this process (never started here, already terminal, or
    /// orphaned by a restart).
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let cancellations = self.cancellations.read().await;
        match cancellations.get(&run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(AgentError::validation(format!("run {run_id} is not active on this node"))),
        }
    }

    /// `get_run(run_id)` (spec §4.10, §6.4).
    pub async fn get_run(&self, run_id: Uuid) -> Result<AgentRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| AgentError::validation(format!("run {run_id} not found")))
    }

    /// Convenience used by callers that don't already hold a `Thread`:
    /// create one and return it, ready for a first `start_run`.
    pub async fn create_thread(&self, owner_id: Option<String>) -> Result<Thread> {
        self.threads.create(Thread::new(owner_id)).await
    }

    /// If `run.expires_at` is set, spawn a background timer that flips
    /// `cancellation` to `Expired` once the deadline passes (spec §3 "any ->
    /// expired by a timer", §5 "`expires_at` on the run record triggers a
    /// timer that flips the cancellation flag").
    fn spawn_expiry_timer(run: &AgentRun, cancellation: CancellationToken) {
        let Some(expires_at) = run.expires_at else {
            return;
        };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        let remaining = (expires_at - now).max(0.0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
            cancellation.expire();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FinishReason, LLMChunk, MockLLMClient};
    use crate::message::MessageQuery;
    use crate::store::in_memory::in_memory_stores;
    use crate::tool::Toolset;

    fn coordinator_with_script(scripts: Vec<Vec<LLMChunk>>) -> (Coordinator, Arc<dyn ThreadStore>, Arc<dyn MessageStore>) {
        let llm = Arc::new(MockLLMClient::new(scripts));
        let tools = Arc::new(Toolset::new("none", "No tools", "Empty toolset"));
        let (threads, messages, runs) = in_memory_stores();
        let engine = Engine::new(llm, tools, threads.clone(), messages.clone(), runs.clone());
        let config = RunConfig {
            model: Some("mock".to_string()),
            ..RunConfig::default()
        };
        let coordinator = Coordinator::new(engine, threads.clone(), messages.clone(), runs, "default", config);
        (coordinator, threads, messages)
    }

    #[tokio::test]
    async fn start_run_emits_created_then_completes_s1_pure_chat() {
        let (coordinator, threads, messages) = coordinator_with_script(vec![vec![
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

        let thread = threads.create(Thread::new(None)).await.unwrap();
        let user_message = Message::user(thread.id, "Say hi.");

        let (run_id, mut stream) = coordinator
            .start_run(thread.id, user_message, RunConfigOverrides::default())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert_eq!(events.first().unwrap().event_type, EventType::AgentRunCreated);
        assert_eq!(events.last().unwrap().event_type, EventType::ThreadRunCompleted);

        let run = coordinator.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let stored = messages.get(thread.id, MessageQuery::default()).await.unwrap();
        assert_eq!(stored.len(), 2, "user message plus assistant reply");
        assert_eq!(stored[0].content.as_text(), "Say hi.");
        assert_eq!(stored[1].content.as_text(), "Hi!");
    }

    #[tokio::test]
    async fn start_run_rejects_unknown_thread() {
        let (coordinator, _threads, _messages) = coordinator_with_script(vec![vec![]]);
        let missing = Uuid::new_v4();
        let result = coordinator
            .start_run(missing, Message::user(missing, "hi"), RunConfigOverrides::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resume_run_rejects_a_run_not_in_requires_action() {
        let (coordinator, threads, _messages) = coordinator_with_script(vec![vec![LLMChunk {
            content: Some("done".to_string()),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }]]);
        let thread = threads.create(Thread::new(None)).await.unwrap();
        let (run_id, mut stream) = coordinator
            .start_run(thread.id, Message::user(thread.id, "hi"), RunConfigOverrides::default())
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        drop(stream);

        let result = coordinator.resume_run(run_id, vec![]).await;
        assert!(result.is_err(), "a completed run cannot be resumed");
    }

    #[tokio::test]
    async fn cancel_run_rejects_an_inactive_run_id() {
        let (coordinator, _threads, _messages) = coordinator_with_script(vec![vec![]]);
        let result = coordinator.cancel_run(Uuid::new_v4()).await;
        assert!(result.is_err());
    }

    // spec §3/§5: `expires_at` on the run record triggers a timer that flips
    // the cancellation flag, distinct from an explicit `cancel_run`.
    #[tokio::test(start_paused = true)]
    async fn expiry_timer_flips_the_cancellation_flag_with_the_expired_reason() {
        let config = RunConfig {
            model: Some("mock".to_string()),
            run_ttl_secs: Some(5),
            ..RunConfig::default()
        };
        let run = AgentRun::new(Uuid::new_v4(), "default", config);
        let cancellation = CancellationToken::new();

        Coordinator::spawn_expiry_timer(&run, cancellation.clone());
        assert!(!cancellation.is_cancelled(), "timer has not fired yet");

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(cancellation.is_cancelled());
        assert_eq!(cancellation.reason(), Some(crate::engine::CancellationReason::Expired));
    }

    #[tokio::test]
    async fn a_run_with_no_ttl_never_gets_an_expiry_timer() {
        let run = AgentRun::new(Uuid::new_v4(), "default", RunConfig::default());
        let cancellation = CancellationToken::new();
        Coordinator::spawn_expiry_timer(&run, cancellation.clone());
        tokio::task::yield_now().await;
        assert!(!cancellation.is_cancelled());
    }
}
