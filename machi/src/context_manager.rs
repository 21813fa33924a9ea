//! The context manager (spec §3, §4.6, C6): assembles the bounded message
//! history handed to the LLM client for a turn, truncating and summarizing
//! under token pressure while never splitting a `tool_calls`/`tool_result`
//! pair (spec §8 invariant 3).

use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::llm::{GenerateOptions, LLMClient};
use crate::message::{Message, Role};
use crate::run::{ContextManagerConfig, ToolChoice};
use crate::thread::{Thread, ThreadStore, ThreadUpdate};

const SUMMARIZE_PROMPT: &str =
    "Summarize the following conversation history concisely, preserving any \
     facts, decisions, or tool results a future turn would need. Respond with \
     the summary only, no preamble.";

/// Assembles the effective LLM input for a turn (spec §4.6).
pub struct ContextManager {
    llm: Arc<dyn LLMClient>,
    threads: Arc<dyn ThreadStore>,
}

impl ContextManager {
    #[must_use]
    pub fn new(llm: Arc<dyn LLMClient>, threads: Arc<dyn ThreadStore>) -> Self {
        Self { llm, threads }
    }

    /// Build the assembled input for one turn.
    ///
    /// `history` is the thread's stored messages in insertion order; `new_input`
    /// is this turn's freshly appended message(s) not yet counted against
    /// `thread.summary`.
    pub async fn assemble(
        &self,
        thread: &Thread,
        history: Vec<Message>,
        new_input: Vec<Message>,
        system_prompt: &str,
        model: &str,
        config: &ContextManagerConfig,
    ) -> Result<Vec<Message>> {
        let mut assembled = Vec::with_capacity(history.len() + new_input.len() + 2);
        assembled.push(Message::system(thread.id, system_prompt));
        if let Some(summary) = &thread.summary {
            assembled.push(Message::system(thread.id, format!("Summary of earlier conversation:\n{summary}")));
        }
        assembled.extend(history);
        assembled.extend(new_input);

        if !config.enable_context_management {
            return Ok(assembled);
        }

        let tokens = self.llm.count_tokens(&assembled, model).await?;
        let trigger = (config.max_input_tokens as f64 * config.summary_trigger_ratio) as usize;
        if tokens < trigger {
            return Ok(assembled);
        }

        assembled = self
            .summarize_and_truncate(thread, assembled, model, config)
            .await?;

        let tokens = self.llm.count_tokens(&assembled, model).await?;
        if tokens > config.max_input_tokens {
            return Err(AgentError::ContextOverflow {
                tokens,
                limit: config.max_input_tokens,
            });
        }

        Ok(assembled)
    }

    async fn summarize_and_truncate(
        &self,
        thread: &Thread,
        assembled: Vec<Message>,
        model: &str,
        config: &ContextManagerConfig,
    ) -> Result<Vec<Message>> {
        let (preserved, droppable) = partition_preserved(&assembled, config.preserve_last_n);

        if droppable.is_empty() {
            return Ok(preserved);
        }

        let mut summary_input = vec![Message::system(thread.id, SUMMARIZE_PROMPT)];
        summary_input.extend(droppable.iter().cloned());
        let options = GenerateOptions {
            model: model.to_string(),
            tools: vec![],
            tool_choice: ToolChoice::None,
            temperature: 0.0,
            max_tokens: None,
            system_prompt: None,
        };
        let response = self.llm.generate(&summary_input, &options).await?;
        let summary_text = response.content.as_text();

        self.threads
            .update(
                thread.id,
                ThreadUpdate {
                    summary: Some(summary_text.clone()),
                    attributes: None,
                },
            )
            .await?;

        let mut result = Vec::with_capacity(preserved.len() + 1);
        // The system/summary preamble is always first in `preserved` (it is
        // never droppable); splice the freshly produced summary in right
        // after it so the model sees the newest recap, not the stale one.
        let mut inserted = false;
        for message in preserved {
            if !inserted && message.role != Role::System {
                result.push(Message::system(
                    thread.id,
                    format!("Summary of earlier conversation:\n{summary_text}"),
                ));
                inserted = true;
            }
            result.push(message);
        }
        if !inserted {
            result.push(Message::system(
                thread.id,
                format!("Summary of earlier conversation:\n{summary_text}"),
            ));
        }

        Ok(result)
    }
}

/// Splits `messages` into `(preserved, droppable)` respecting spec §4.6/§8:
/// every `system` message is preserved; the last `preserve_last_n` messages
/// are preserved; an assistant message carrying `tool_calls` is preserved (and
/// kept adjacent to) its matching `role=tool` result messages.
fn partition_preserved(messages: &[Message], preserve_last_n: usize) -> (Vec<Message>, Vec<Message>) {
    let len = messages.len();
    let tail_start = len.saturating_sub(preserve_last_n);

    let mut preserve_flags = vec![false; len];
    for (i, message) in messages.iter().enumerate() {
        if message.role == Role::System || i >= tail_start {
            preserve_flags[i] = true;
        }
    }

    // Pull in any tool_result whose tool_calls message is preserved, and vice
    // versa, until the set stops growing (handles a tool_calls message whose
    // results land just inside/outside the preserved tail).
    loop {
        let mut changed = false;
        for i in 0..len {
            if !preserve_flags[i] {
                continue;
            }
            if messages[i].has_tool_calls() {
                let call_ids: Vec<&str> = messages[i]
                    .attributes
                    .tool_calls
                    .as_ref()
                    .into_iter()
                    .flatten()
                    .map(|c| c.id.as_str())
                    .collect();
                for (j, other) in messages.iter().enumerate() {
                    if !preserve_flags[j]
                        && other.role == Role::Tool
                        && other
                            .attributes
                            .tool_call_id
                            .as_deref()
                            .is_some_and(|id| call_ids.contains(&id))
                    {
                        preserve_flags[j] = true;
                        changed = true;
                    }
                }
            } else if messages[i].role == Role::Tool {
                if let Some(call_id) = &messages[i].attributes.tool_call_id {
                    for (j, other) in messages.iter().enumerate() {
                        if !preserve_flags[j]
                            && other
                                .attributes
                                .tool_calls
                                .as_ref()
                                .is_some_and(|calls| calls.iter().any(|c| &c.id == call_id))
                        {
                            preserve_flags[j] = true;
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    let mut preserved = Vec::new();
    let mut droppable = Vec::new();
    for (message, keep) in messages.iter().cloned().zip(preserve_flags) {
        if keep {
            preserved.push(message);
        } else {
            droppable.push(message);
        }
    }
    (preserved, droppable)
}
