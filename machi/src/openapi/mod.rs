//! The OpenAPI spec parser and connector (spec §4.1, §4.2, C1/C2).
//!
//! No teacher or pack file parses OpenAPI directly (checked every
//! `Cargo.toml` in the retrieval pack for `openapiv3`/`utoipa`; none carry
//! it), so `parser.rs` walks `serde_json::Value` by hand rather than pulling
//! in a schema crate the corpus never reaches for. `connector.rs` wraps the
//! parsed operations as [`crate::tool::Tool`]s over `reqwest`, the
//! transport the host crate already depends on for every other provider.

pub mod auth;
pub mod connector;
pub mod parser;

pub use connector::{ConnectorOptions, OpenApiConnector};
pub use parser::{OpenApiParser, Operation, Parameter, ParameterLocation};
