//! The streaming response parser (spec §4.4, C4) — the incremental
//! demultiplexer turning a sequence of [`LLMChunk`](crate::llm::LLMChunk)
//! into a well-typed [`ParseEvent`] stream.
//!
//! The per-index tool-call assembly is the key insight (spec §9): keys
//! arrive out of order and fields may be split across chunks, so deltas are
//! merged into a `BTreeMap<usize, PartialToolCall>` keyed by index, and
//! finalization (on `finish_reason=tool_calls`) iterates in ascending index
//! order for free.

use std::collections::BTreeMap;

use crate::llm::{FinishReason, LLMChunk};
use crate::message::ToolCall;
use crate::usage::Usage;

mod xml;

pub use xml::XmlScannerConfig;

/// One event produced by parsing a streaming LLM response (spec §4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    TextChunk(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        args_fragment: Option<String>,
    },
    ToolCallFinalized(ToolCall),
    Completed {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
}

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    args_buffer: String,
}

impl PartialToolCall {
    fn finalize(&self) -> ToolCall {
        ToolCall::new(
            self.id.clone().unwrap_or_default(),
            self.name.clone().unwrap_or_default(),
            self.args_buffer.clone(),
        )
    }
}

/// The per-run parser state machine (spec §4.4).
///
/// Idempotence (spec §8 invariant 7): the parser carries no hidden state
/// beyond this struct, so replaying the same chunk sequence against a fresh
/// `ResponseParser` yields the same event sequence.
pub struct ResponseParser {
    tool_calls: BTreeMap<usize, PartialToolCall>,
    xml: Option<xml::XmlScanner>,
}

impl ResponseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tool_calls: BTreeMap::new(),
            xml: None,
        }
    }

    /// Enable XML tool-call scanning (spec §4.4 "XML tool-call mode"),
    /// disabled by default so the default code path is not burdened (spec §9).
    #[must_use]
    pub fn with_xml_scanning(max_tool_calls: usize) -> Self {
        Self {
            tool_calls: BTreeMap::new(),
            xml: Some(xml::XmlScanner::new(XmlScannerConfig { max_tool_calls })),
        }
    }

    /// Feed one chunk, producing zero or more events.
    pub fn feed(&mut self, chunk: &LLMChunk) -> Vec<ParseEvent> {
        let mut events = Vec::new();

        if let Some(content) = chunk.content.as_deref() {
            if !content.is_empty() {
                if let Some(xml) = &mut self.xml {
                    let (text, synthesized) = xml.scan(content);
                    if !text.is_empty() {
                        events.push(ParseEvent::TextChunk(text));
                    }
                    for call in synthesized {
                        events.push(ParseEvent::ToolCallFinalized(call));
                    }
                } else {
                    events.push(ParseEvent::TextChunk(content.to_string()));
                }
            }
        }

        for delta in &chunk.tool_calls {
            let entry = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = &delta.id {
                entry.id = Some(id.clone());
            }
            if let Some(name) = &delta.name {
                entry.name = Some(name.clone());
            }
            if let Some(args) = &delta.arguments {
                entry.args_buffer.push_str(args);
            }
            events.push(ParseEvent::ToolCallDelta {
                index: delta.index,
                id: delta.id.clone(),
                name: delta.name.clone(),
                args_fragment: delta.arguments.clone(),
            });
        }

        if let Some(finish_reason) = chunk.finish_reason {
            if finish_reason == FinishReason::ToolCalls {
                for partial in self.tool_calls.values() {
                    events.push(ParseEvent::ToolCallFinalized(partial.finalize()));
                }
            }
            events.push(ParseEvent::Completed {
                finish_reason,
                usage: chunk.usage,
            });
        }

        events
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
