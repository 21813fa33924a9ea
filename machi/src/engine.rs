//! The agent run engine (spec §3, §4.7, C7): the turn loop that drives a
//! [`crate::run::AgentRun`] through its state machine, streaming
//! [`Envelope`] events as the LLM and tools are driven.
//!
//! Grounded on the teacher's `agent::runner::Runner::run_streamed_inner`: a
//! single `async_stream::try_stream!` generator owns all per-run state and
//! yields lifecycle events as it goes, rather than splitting a blocking and
//! a streaming code path. Unlike the teacher, there is no non-streaming
//! entry point — spec §4.7 only defines the streaming turn loop, and every
//! caller (including the delegation tool's sub-run) consumes the event
//! stream to completion to get a final answer.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info_span, warn, Instrument};

use crate::context_manager::ContextManager;
use crate::error::{AgentError, LlmErrorKind, Result};
use crate::event::{Envelope, EventType};
use crate::llm::{FinishReason, GenerateOptions, LLMClient};
use crate::message::{Message, MessageQuery, MessageUpdate, Role, ToolCall};
use crate::response_parser::{ParseEvent, ResponseParser};
use crate::run::{AgentRun, RunStatus, RunStore};
use crate::thread::{Thread, ThreadStore};
use crate::tool::ToolProvider;
use crate::tool_executor::ToolExecutor;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Backoff before the one silent retry of a transport error that produced no
/// bytes yet for the current assistant message (spec §7).
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// LLM streaming idle timeout: no bytes for this long is treated as a stream
/// error (spec §5 "LLM streaming MUST respect an idle-timeout (default 60 s
/// with no bytes -> treated as stream error)").
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a [`CancellationToken`] was flipped: an explicit `cancel_run` call
/// versus a run's `expires_at` timer firing (spec §3 "any -> expired by a
/// timer"). The engine's suspension-point checks use this to decide whether
/// the run lands in `Cancelled` or `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    UserRequested,
    Expired,
}

/// Cooperative cancellation flag for one run (spec §5, §7 "cancellation is
/// cooperative"). Checked at each suspension point named in spec §4.7: after
/// each delta, before each LLM call, before each tool call.
///
/// `tokio_util::sync::CancellationToken` would do the same job, but pulling
/// in a new dependency for an `AtomicBool` + `Notify` pair the crate can
/// trivially hand-roll was not worth it.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<AtomicU8>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(AtomicU8::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request cancellation on behalf of an explicit `cancel_run` call.
    /// Idempotent.
    pub fn cancel(&self) {
        self.set(CancellationReason::UserRequested);
    }

    /// Flip the flag because the run's `expires_at` timer fired. Idempotent;
    /// does not override a reason already set (first flip wins).
    pub fn expire(&self) {
        self.set(CancellationReason::Expired);
    }

    fn set(&self, reason: CancellationReason) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reason.store(reason as u8, Ordering::Release);
        }
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The reason cancellation was requested, if it has been.
    #[must_use]
    pub fn reason(&self) -> Option<CancellationReason> {
        if !self.is_cancelled() {
            return None;
        }
        Some(match self.reason.load(Ordering::Acquire) {
            1 => CancellationReason::Expired,
            _ => CancellationReason::UserRequested,
        })
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an [`AgentRun`] through the turn loop against one [`ToolProvider`]
/// (spec §4.7). A sub-run spawned by the delegation tool (§4.8) constructs
/// its own `Engine` over an isolated provider and store set rather than
/// reusing the parent's.
pub struct Engine {
    llm: Arc<dyn LLMClient>,
    tool_provider: Arc<dyn ToolProvider>,
    context_manager: ContextManager,
    threads: Arc<dyn ThreadStore>,
    messages: Arc<dyn crate::message::MessageStore>,
    runs: Arc<dyn RunStore>,
}

impl Engine {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LLMClient>,
        tool_provider: Arc<dyn ToolProvider>,
        threads: Arc<dyn ThreadStore>,
        messages: Arc<dyn crate::message::MessageStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        let context_manager = ContextManager::new(llm.clone(), threads.clone());
        Self {
            llm,
            tool_provider,
            context_manager,
            threads,
            messages,
            runs,
        }
    }

    /// Run (or resume) `run` against `thread`, persisting every message and
    /// run-state transition as it goes, and streaming the wire [`Envelope`]s
    /// for a caller to forward (spec §4.7, §4.10).
    ///
    /// `new_inputs` are messages not yet in the store — the turn's fresh
    /// user input on a first call, or tool outputs supplied to
    /// `resume_run` after a `requires_action` pause. They are persisted and
    /// announced before the loop starts; every subsequent turn re-reads the
    /// full history from the store, so nothing here is threaded through the
    /// loop body itself.
    #[allow(tail_expr_drop_order)]
    pub fn run_streamed(
        &self,
        thread: Thread,
        run: AgentRun,
        new_inputs: Vec<Message>,
        cancellation: CancellationToken,
    ) -> impl Stream<Item = Result<Envelope>> + Send + '_ {
        async_stream::try_stream! {
            let mut run = run;
            let thread_id = thread.id;
            let run_id = run.id;

            let Some(model) = run.config.model.clone() else {
                run.last_error = Some((&AgentError::configuration("RunConfig.model is required")).into());
                run.transition(RunStatus::Failed);
                self.runs.update(run.clone()).await?;
                yield Envelope::new(EventType::ThreadRunFailed, run_id, thread_id, json!({"code": "configuration_error"}));
                return;
            };

            run.transition(RunStatus::InProgress);
            self.runs.update(run.clone()).await?;
            yield Envelope::new(
                EventType::AgentRunStatusChanged,
                run_id,
                thread_id,
                json!({"status": "in_progress"}),
            );

            for input in new_inputs {
                let stored = self.messages.add(input).await?;
                yield Envelope::new(
                    EventType::ThreadMessageCreated,
                    run_id,
                    thread_id,
                    json!({"message_id": stored.id, "role": stored.role}),
                );
            }

            self.tool_provider.ensure_initialized().await?;

            let system_prompt = run.config.system_prompt.clone().unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
            let max_calls = run.config.max_tool_call_continuations;

            let mut step: usize = 0;
            loop {
                step += 1;

                if cancellation.is_cancelled() {
                    let expired = cancellation.reason() == Some(CancellationReason::Expired);
                    let (status, label) = if expired {
                        (RunStatus::Expired, "expired")
                    } else {
                        (RunStatus::Cancelled, "cancelled")
                    };
                    run.last_error = Some((&if expired { AgentError::Expired } else { AgentError::Cancelled }).into());
                    run.transition(status);
                    self.runs.update(run.clone()).await?;
                    yield Envelope::new(EventType::AgentRunStatusChanged, run_id, thread_id, json!({"status": label}));
                    return;
                }

                if step > max_calls {
                    let err = AgentError::ContinuationLimitExceeded { max: run.config.max_tool_call_continuations };
                    run.last_error = Some((&err).into());
                    run.transition(RunStatus::RequiresAction);
                    self.runs.update(run.clone()).await?;
                    yield Envelope::new(
                        EventType::ThreadRunRequiresAction,
                        run_id,
                        thread_id,
                        json!({"reason": "limit_exceeded"}),
                    );
                    return;
                }

                yield Envelope::new(
                    EventType::AgentRunStepCreated,
                    run_id,
                    thread_id,
                    json!({"step": step}),
                );
                yield Envelope::new(
                    EventType::AgentRunStatusChanged,
                    run_id,
                    thread_id,
                    json!({"status": "llm_call", "step": step}),
                );

                let history = self.messages.get(thread_id, MessageQuery::default()).await?;
                let tools = self.tool_provider.get_tools().await?;
                let messages = self
                    .context_manager
                    .assemble(&thread, history, vec![], &system_prompt, &model, &run.config.context_manager)
                    .await?;

                let options = GenerateOptions {
                    model: model.clone(),
                    tools,
                    tool_choice: run.config.tool_choice.clone(),
                    temperature: run.config.temperature,
                    max_tokens: run.config.max_tokens,
                    system_prompt: Some(system_prompt.clone()),
                };

                let shell = self.messages.add(Message::assistant_shell(thread_id)).await?;
                let shell_id = shell.id;
                yield Envelope::new(
                    EventType::ThreadMessageCreated,
                    run_id,
                    thread_id,
                    json!({"message_id": shell_id, "status": "in_progress"}),
                );

                let mut text_buffer = String::new();
                let mut finalized_calls: Vec<ToolCall> = Vec::new();
                let mut seen_indices: HashSet<usize> = HashSet::new();
                let mut finish_reason: Option<FinishReason> = None;
                let mut bytes_emitted = false;
                let mut retried = false;

                'attempt: loop {
                    let stream_result = self
                        .llm
                        .generate_stream(&messages, &options)
                        .instrument(info_span!("llm_call", run.id = %run_id, step))
                        .await;

                    let mut chunk_stream: Pin<Box<dyn Stream<Item = Result<crate::llm::LLMChunk>> + Send>> =
                        match stream_result {
                            Ok(stream) => stream,
                            Err(err) if !retried => {
                                warn!(error = %err, "llm stream failed to establish, retrying once");
                                retried = true;
                                tokio::time::sleep(RETRY_BACKOFF).await;
                                continue 'attempt;
                            }
                            Err(err) => {
                                run.last_error = Some((&err).into());
                                run.transition(RunStatus::Failed);
                                self.runs.update(run.clone()).await?;
                                yield Envelope::new(EventType::ThreadRunFailed, run_id, thread_id, json!({"code": err.code()}));
                                return;
                            }
                        };

                    let mut parser = ResponseParser::new();
                    let mut transport_failed = false;

                    loop {
                        let item = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, chunk_stream.next()).await {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(_elapsed) if !bytes_emitted && !retried => {
                                warn!(timeout = ?STREAM_IDLE_TIMEOUT, "llm stream idle before any bytes, retrying once");
                                retried = true;
                                transport_failed = true;
                                break;
                            }
                            Err(_elapsed) => {
                                let err = AgentError::llm(
                                    LlmErrorKind::Timeout,
                                    format!("no bytes from LLM stream for {STREAM_IDLE_TIMEOUT:?}"),
                                );
                                run.last_error = Some((&err).into());
                                run.transition(RunStatus::Failed);
                                self.runs.update(run.clone()).await?;
                                yield Envelope::new(EventType::ThreadRunFailed, run_id, thread_id, json!({"code": err.code()}));
                                return;
                            }
                        };

                        let chunk = match item {
                            Ok(chunk) => chunk,
                            Err(err) if !bytes_emitted && !retried => {
                                warn!(error = %err, "llm stream errored before any bytes, retrying once");
                                retried = true;
                                transport_failed = true;
                                break;
                            }
                            Err(err) => {
                                run.last_error = Some((&err).into());
                                run.transition(RunStatus::Failed);
                                self.runs.update(run.clone()).await?;
                                yield Envelope::new(EventType::ThreadRunFailed, run_id, thread_id, json!({"code": err.code()}));
                                return;
                            }
                        };

                        for event in parser.feed(&chunk) {
                            match event {
                                ParseEvent::TextChunk(text) => {
                                    bytes_emitted = true;
                                    text_buffer.push_str(&text);
                                    yield Envelope::new(
                                        EventType::ThreadMessageDelta,
                                        run_id,
                                        thread_id,
                                        json!({"message_id": shell_id, "content_chunk": text}),
                                    );
                                }
                                ParseEvent::ToolCallDelta { index, id, name, args_fragment } => {
                                    bytes_emitted = true;
                                    if seen_indices.insert(index) {
                                        yield Envelope::new(
                                            EventType::ThreadRunStepToolCallCreated,
                                            run_id,
                                            thread_id,
                                            json!({"message_id": shell_id, "index": index, "id": id}),
                                        );
                                    }
                                    yield Envelope::new(
                                        EventType::ThreadMessageDelta,
                                        run_id,
                                        thread_id,
                                        json!({
                                            "message_id": shell_id,
                                            "tool_call_chunk": {
                                                "index": index,
                                                "id": id,
                                                "name": name,
                                                "arguments_chunk": args_fragment,
                                            }
                                        }),
                                    );
                                }
                                ParseEvent::ToolCallFinalized(call) => {
                                    yield Envelope::new(
                                        EventType::ThreadRunStepToolCallCompletedByLlm,
                                        run_id,
                                        thread_id,
                                        json!({"message_id": shell_id, "tool_call_id": call.id}),
                                    );
                                    finalized_calls.push(call);
                                }
                                ParseEvent::Completed { finish_reason: reason, .. } => {
                                    finish_reason = Some(reason);
                                }
                            }
                        }

                        if cancellation.is_cancelled() {
                            let expired = cancellation.reason() == Some(CancellationReason::Expired);
                            let (status, label) = if expired {
                                (RunStatus::Expired, "expired")
                            } else {
                                (RunStatus::Cancelled, "cancelled")
                            };
                            run.last_error = Some((&if expired { AgentError::Expired } else { AgentError::Cancelled }).into());
                            run.transition(status);
                            self.runs.update(run.clone()).await?;
                            yield Envelope::new(EventType::AgentRunStatusChanged, run_id, thread_id, json!({"status": label}));
                            return;
                        }
                    }

                    if transport_failed {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue 'attempt;
                    }

                    break 'attempt;
                }

                let attributes = if finalized_calls.is_empty() {
                    crate::message::MessageAttributes::default()
                } else {
                    crate::message::MessageAttributes {
                        tool_calls: Some(finalized_calls.clone()),
                        ..Default::default()
                    }
                };
                let content = if text_buffer.is_empty() {
                    crate::message::Content::None
                } else {
                    crate::message::Content::text(text_buffer.clone())
                };
                self.messages
                    .update(
                        shell_id,
                        MessageUpdate {
                            content: Some(content),
                            attributes: Some(attributes),
                        },
                    )
                    .await?;
                yield Envelope::new(
                    EventType::ThreadMessageCompleted,
                    run_id,
                    thread_id,
                    json!({"message_id": shell_id}),
                );

                match finish_reason {
                    Some(FinishReason::Stop | FinishReason::Length | FinishReason::ContentFilter) => {
                        run.transition(RunStatus::Completed);
                        self.runs.update(run.clone()).await?;
                        yield Envelope::new(EventType::ThreadRunCompleted, run_id, thread_id, json!({"message_id": shell_id}));
                        return;
                    }
                    Some(FinishReason::ToolCalls) => {
                        yield Envelope::new(
                            EventType::ThreadRunRequiresAction,
                            run_id,
                            thread_id,
                            json!({"submit_tool_outputs": finalized_calls.iter().map(|c| &c.id).collect::<Vec<_>>()}),
                        );

                        if cancellation.is_cancelled() {
                            let expired = cancellation.reason() == Some(CancellationReason::Expired);
                            let (status, label) = if expired {
                                (RunStatus::Expired, "expired")
                            } else {
                                (RunStatus::Cancelled, "cancelled")
                            };
                            run.last_error = Some((&if expired { AgentError::Expired } else { AgentError::Cancelled }).into());
                            run.transition(status);
                            self.runs.update(run.clone()).await?;
                            yield Envelope::new(EventType::AgentRunStatusChanged, run_id, thread_id, json!({"status": label}));
                            return;
                        }

                        for call in &finalized_calls {
                            yield Envelope::new(
                                EventType::AgentToolExecutionStarted,
                                run_id,
                                thread_id,
                                json!({"tool_call_id": call.id, "name": call.function.name}),
                            );
                        }

                        let executor = ToolExecutor::new(
                            self.tool_provider.clone(),
                            run.config.tool_executor.execution_strategy,
                            run.config.tool_executor.max_concurrency,
                        );
                        let records = executor.execute_batch(&finalized_calls).await?;

                        for record in &records {
                            yield Envelope::new(
                                EventType::AgentToolExecutionCompleted,
                                run_id,
                                thread_id,
                                json!({
                                    "tool_call_id": record.call.id,
                                    "success": record.result.success,
                                }),
                            );
                            let tool_message = Message::tool_result(
                                thread_id,
                                record.call.id.clone(),
                                record.result.to_content_string(),
                            );
                            let stored = self.messages.add(tool_message).await?;
                            yield Envelope::new(
                                EventType::ThreadMessageCreated,
                                run_id,
                                thread_id,
                                json!({"message_id": stored.id, "role": "tool", "tool_call_id": record.call.id}),
                            );
                        }
                    }
                    Some(FinishReason::Other) | None => {
                        let err = AgentError::llm(LlmErrorKind::Api, "model finished with an unrecognized or missing finish reason");
                        run.last_error = Some((&err).into());
                        run.transition(RunStatus::Failed);
                        self.runs.update(run.clone()).await?;
                        yield Envelope::new(EventType::ThreadRunFailed, run_id, thread_id, json!({"code": err.code()}));
                        return;
                    }
                }
            }
        }
    }
}
