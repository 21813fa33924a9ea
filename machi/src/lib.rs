#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! `machi` is a durable agent run engine: it drives goal-directed
//! conversations between a user and an LLM that is permitted to call tools
//! mid-turn, exposing the loop as a resumable "run" against a persistent
//! "thread" and a fine-grained event stream a client consumes in real time.
//!
//! The core pieces, leaves first:
//!
//! - [`openapi`] — parses an OpenAPI document into typed [`tool`]
//!   definitions and executes them over HTTP.
//! - [`tool`] — the `Tool`/`ToolProvider` abstraction, toolsets, and the
//!   name-collision-aware aggregator.
//! - [`response_parser`] — demultiplexes a streaming LLM delta sequence into
//!   text chunks and incrementally assembled tool calls.
//! - [`tool_executor`] — resolves and invokes tool calls, sequentially or in
//!   parallel, normalizing every outcome so a failing tool never aborts a
//!   run.
//! - [`context_manager`] — assembles the token-budgeted message history
//!   handed to the LLM for a turn, summarizing under pressure.
//! - [`engine`] — the turn loop itself: the per-run state machine that
//!   interleaves LLM calls, streaming parsing, and tool dispatch.
//! - [`delegation`] — a tool that recursively spawns an isolated sub-run
//!   against a single specialist toolset.
//! - [`toolset_orchestrator`] — turns tool-provider source configuration
//!   into named, grouped toolsets.
//! - [`coordinator`] — the transport-agnostic `start_run`/`resume_run`/
//!   `cancel_run`/`get_run` façade a caller drives.
//!
//! [`thread`], [`message`], [`run`], [`event`], and [`usage`] hold the
//! durable data model; [`store`] holds the storage collaborator traits and
//! an in-memory reference implementation; [`llm`] holds the external LLM
//! client collaborator trait and a scriptable mock; [`error`] holds the
//! crate-wide error taxonomy.

extern crate self as machi;

pub mod context_manager;
pub mod coordinator;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod openapi;
pub mod prelude;
pub mod response_parser;
pub mod run;
pub mod store;
pub mod thread;
pub mod tool;
pub mod tool_executor;
pub mod toolset_orchestrator;
pub mod usage;
