//! Turns a tool-provider source description into one or more named,
//! ready-to-use toolsets.
//!
//! One [`ToolProviderSourceConfig`] names a single OpenAPI document; the
//! orchestrator decides how many [`NamedToolset`]s it becomes — one
//! (`allInOne`) or one per tag (`byTag`) — and, when a group would still be
//! too large for a model to reason over in one tool-calling turn, partitions
//! it further into uniformly-sized shards rather than attempting an
//! LLM-assisted semantic split.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::openapi::{ConnectorOptions, OpenApiConnector, OpenApiParser};
use crate::run::AuthSpec;
use crate::tool::{DynTool, NamedToolset, ToolDefinition, ToolProvider};

/// How a single OpenAPI source's operations are grouped into toolsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ToolsetCreationStrategy {
    /// One toolset carrying every operation in the document.
    #[default]
    AllInOne,
    /// One toolset per OpenAPI tag, in the document's first-seen tag order.
    ByTag,
}

/// Construction-time description of one tool-provider source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderSourceConfig {
    /// Stable id for this source; prefixed onto every toolset id it produces.
    pub id: String,
    pub spec: Value,
    pub base_url: String,
    #[serde(default = "default_static_auth")]
    pub static_auth: AuthSpec,
    #[serde(default)]
    pub creation_strategy: ToolsetCreationStrategy,
    /// When a group would exceed this many tools, partition it into
    /// uniformly-sized shards instead of handing the model an oversized
    /// toolset.
    #[serde(default)]
    pub max_tools_per_logical_group: Option<usize>,
    #[serde(default)]
    pub include_generic_http_tool: bool,
    /// Per-call HTTP timeout for every connector this source produces (spec
    /// §5, default 30 s, configurable).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_static_auth() -> AuthSpec {
    AuthSpec::None
}

fn default_request_timeout_secs() -> u64 {
    ConnectorOptions::default_timeout().as_secs()
}

/// Build every [`NamedToolset`] this source produces.
pub async fn orchestrate(source: &ToolProviderSourceConfig) -> Result<Vec<NamedToolset>> {
    let groups = match source.creation_strategy {
        ToolsetCreationStrategy::AllInOne => vec![group_for_all_in_one(source)?],
        ToolsetCreationStrategy::ByTag => group_for_by_tag(source)?,
    };

    let mut toolsets = Vec::with_capacity(groups.len());
    for group in groups {
        toolsets.extend(partition_if_oversized(group, source.max_tools_per_logical_group).await?);
    }
    Ok(toolsets)
}

/// One connector/toolset pair before any size-based partitioning.
struct LogicalGroup {
    id: String,
    name: String,
    description: String,
    provider: Arc<dyn ToolProvider>,
}

fn group_for_all_in_one(source: &ToolProviderSourceConfig) -> Result<LogicalGroup> {
    let connector = OpenApiConnector::new(
        source.spec.clone(),
        ConnectorOptions {
            base_url: source.base_url.clone(),
            static_auth: source.static_auth.clone(),
            source_id: source.id.clone(),
            tag_filter: None,
            include_generic_http_tool: source.include_generic_http_tool,
            request_timeout: Duration::from_secs(source.request_timeout_secs),
        },
    )?;
    Ok(LogicalGroup {
        id: source.id.clone(),
        name: source.id.clone(),
        description: format!("All operations from '{}'", source.id),
        provider: Arc::new(connector),
    })
}

fn group_for_by_tag(source: &ToolProviderSourceConfig) -> Result<Vec<LogicalGroup>> {
    let parser = OpenApiParser::new(source.spec.clone(), None)?;
    let tags = parser.tags();

    if tags.is_empty() {
        return Ok(vec![group_for_all_in_one(source)?]);
    }

    tags.into_iter()
        .map(|tag| {
            let connector = OpenApiConnector::new(
                source.spec.clone(),
                ConnectorOptions {
                    base_url: source.base_url.clone(),
                    static_auth: source.static_auth.clone(),
                    source_id: format!("{}#{tag}", source.id),
                    tag_filter: Some(tag.clone()),
                    // The generic escape hatch is only meaningful once, on
                    // the untagged/all-in-one group (ConnectorOptions already
                    // suppresses it whenever a tag filter is set).
                    include_generic_http_tool: source.include_generic_http_tool,
                    request_timeout: Duration::from_secs(source.request_timeout_secs),
                },
            )?;
            Ok(LogicalGroup {
                id: format!("{}#{tag}", source.id),
                name: tag.clone(),
                description: format!("Operations from '{}' tagged '{tag}'", source.id),
                provider: Arc::new(connector),
            })
        })
        .collect()
}

/// If `group` has more tools than `max_per_group`, split it into
/// uniformly-sized shards, each a [`FilteredProvider`] over the same
/// underlying connector. Below the limit (or with no limit set), returns the
/// group unchanged as the sole element.
async fn partition_if_oversized(
    group: LogicalGroup,
    max_per_group: Option<usize>,
) -> Result<Vec<NamedToolset>> {
    let Some(max_per_group) = max_per_group.filter(|m| *m > 0) else {
        return Ok(vec![NamedToolset::new(group.id, group.name, group.description, group.provider)]);
    };

    group.provider.ensure_initialized().await?;
    let defs = group.provider.get_tools().await?;

    if defs.len() <= max_per_group {
        return Ok(vec![NamedToolset::new(group.id, group.name, group.description, group.provider)]);
    }

    let mut names: Vec<String> = defs.into_iter().map(|d| d.name).collect();
    names.sort();

    let shards: Vec<Vec<String>> = names
        .chunks(max_per_group)
        .map(<[String]>::to_vec)
        .collect();
    let total = shards.len();

    Ok(shards
        .into_iter()
        .enumerate()
        .map(|(i, names)| {
            let id = format!("{}#{}", group.id, i + 1);
            let name = format!("{} ({}/{total})", group.name, i + 1);
            let description = format!("{} — shard {}/{total}", group.description, i + 1);
            let provider: Arc<dyn ToolProvider> = Arc::new(FilteredProvider {
                inner: group.provider.clone(),
                allowed: names.into_iter().collect(),
            });
            NamedToolset::new(id, name, description, provider)
        })
        .collect())
}

/// Restricts an underlying provider's listing/lookup to a fixed set of tool
/// names, the mechanism [`partition_if_oversized`] uses to shard one
/// oversized connector into several smaller toolsets without duplicating its
/// HTTP execution logic.
struct FilteredProvider {
    inner: Arc<dyn ToolProvider>,
    allowed: HashSet<String>,
}

#[async_trait]
impl ToolProvider for FilteredProvider {
    async fn get_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(self
            .inner
            .get_tools()
            .await?
            .into_iter()
            .filter(|d| self.allowed.contains(&d.name))
            .collect())
    }

    async fn get_tool(&self, name: &str) -> Result<Option<Arc<dyn DynTool>>> {
        if self.allowed.contains(name) {
            self.inner.get_tool(name).await
        } else {
            Ok(None)
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.inner.ensure_initialized().await
    }
}
