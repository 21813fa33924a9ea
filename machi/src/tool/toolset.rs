//! Toolset grouping and the aggregating tool-provider (spec §3, §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{BoxedTool, ToolDefinition};

/// A named group of tools with a shared description (spec §3 `Toolset`).
///
/// Invariant: tool names within a toolset are unique — `add_tool` overwrites
/// silently on a name collision within the *same* toolset, matching the
/// "last insert wins locally" behavior a `HashMap`-backed set naturally has.
pub struct Toolset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub attributes: Option<Value>,
    tools: HashMap<String, Arc<dyn super::DynTool>>,
}

impl Toolset {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            attributes: None,
            tools: HashMap::new(),
        }
    }

    pub fn add_tool(&mut self, tool: BoxedTool) {
        let tool: Arc<dyn super::DynTool> = Arc::from(tool);
        self.tools.insert(tool.definition().name, tool);
    }

    #[must_use]
    pub fn with_tool(mut self, tool: BoxedTool) -> Self {
        self.add_tool(tool);
        self
    }

    #[must_use]
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Uniform tool lookup across sources (spec §4.3). Implementations may
/// perform network or disk I/O while listing/resolving tools, hence
/// `async_trait`.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>>;
    async fn get_tool(&self, name: &str) -> crate::error::Result<Option<Arc<dyn super::DynTool>>>;

    /// Idempotent, deduplicated lazy initialization. Default no-op for
    /// providers with nothing to load.
    async fn ensure_initialized(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ToolProvider for Toolset {
    async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>> {
        Ok(self.tool_definitions())
    }

    async fn get_tool(&self, name: &str) -> crate::error::Result<Option<Arc<dyn super::DynTool>>> {
        Ok(self.tools.get(name).cloned())
    }
}

/// A [`ToolProvider`] labeled with the id/name/description a caller
/// addresses it by — the shape the delegation tool and the toolset
/// orchestrator both hand toolsets around as, regardless of whether the
/// underlying provider is a static [`Toolset`] or a lazily-initialized
/// connector such as `crate::openapi::OpenApiConnector`.
pub struct NamedToolset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub provider: Arc<dyn ToolProvider>,
}

impl NamedToolset {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        provider: Arc<dyn ToolProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            provider,
        }
    }
}

#[async_trait]
impl ToolProvider for NamedToolset {
    async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>> {
        self.provider.get_tools().await
    }

    async fn get_tool(&self, name: &str) -> crate::error::Result<Option<Arc<dyn super::DynTool>>> {
        self.provider.get_tool(name).await
    }

    async fn ensure_initialized(&self) -> crate::error::Result<()> {
        self.provider.ensure_initialized().await
    }
}

impl From<Toolset> for NamedToolset {
    fn from(toolset: Toolset) -> Self {
        let id = toolset.id.clone();
        let name = toolset.name.clone();
        let description = toolset.description.clone();
        Self::new(id, name, description, Arc::new(toolset))
    }
}

/// Aggregates an ordered list of providers with first-wins name-collision
/// resolution (spec §4.3, §9 "Aggregator name-collision policy"). Sources
/// earlier in the list are authoritative.
pub struct Aggregator {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl Aggregator {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ToolProvider for Aggregator {
    async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for provider in &self.providers {
            match provider.get_tools().await {
                Ok(defs) => {
                    for def in defs {
                        if seen.contains(&def.name) {
                            tracing::warn!(tool.name = %def.name, "tool name collision, keeping earlier provider's definition");
                            continue;
                        }
                        seen.insert(def.name.clone());
                        out.push(def);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "tool provider failed during listing, continuing with remaining providers");
                }
            }
        }
        Ok(out)
    }

    async fn get_tool(&self, name: &str) -> crate::error::Result<Option<Arc<dyn super::DynTool>>> {
        for provider in &self.providers {
            match provider.get_tool(name).await {
                Ok(Some(tool)) => return Ok(Some(tool)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, tool.name = name, "tool provider failed during lookup, continuing with remaining providers");
                }
            }
        }
        Ok(None)
    }

    async fn ensure_initialized(&self) -> crate::error::Result<()> {
        for provider in &self.providers {
            provider.ensure_initialized().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolError, ToolParameter};

    struct Stub(&'static str);

    #[async_trait]
    impl Tool for Stub {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(self.0, "stub").with_parameter(ToolParameter::new(
                "x", "string", "x", false,
            ))
        }

        async fn call(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct StubProvider(Vec<&'static str>);

    #[async_trait]
    impl ToolProvider for StubProvider {
        async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>> {
            Ok(self
                .0
                .iter()
                .map(|name| ToolDefinition::new(*name, "stub"))
                .collect())
        }

        async fn get_tool(&self, name: &str) -> crate::error::Result<Option<Arc<dyn super::super::DynTool>>> {
            Ok(self
                .0
                .iter()
                .find(|n| **n == name)
                .map(|n| Arc::new(Stub(n)) as Arc<dyn super::super::DynTool>))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ToolProvider for FailingProvider {
        async fn get_tools(&self) -> crate::error::Result<Vec<ToolDefinition>> {
            Err(crate::error::AgentError::configuration("boom"))
        }

        async fn get_tool(&self, _name: &str) -> crate::error::Result<Option<Arc<dyn super::super::DynTool>>> {
            Err(crate::error::AgentError::configuration("boom"))
        }
    }

    #[tokio::test]
    async fn first_provider_wins_on_name_collision() {
        let a: Arc<dyn ToolProvider> = Arc::new(StubProvider(vec!["search"]));
        let b: Arc<dyn ToolProvider> = Arc::new(StubProvider(vec!["search", "other"]));
        let agg = Aggregator::new(vec![a, b]);
        let tools = agg.get_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"search"));
        assert!(names.contains(&"other"));
    }

    #[tokio::test]
    async fn listing_continues_past_a_failing_provider() {
        let ok: Arc<dyn ToolProvider> = Arc::new(StubProvider(vec!["ok_tool"]));
        let bad: Arc<dyn ToolProvider> = Arc::new(FailingProvider);
        let agg = Aggregator::new(vec![bad, ok]);
        let tools = agg.get_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ok_tool");
    }

    #[tokio::test]
    async fn get_tool_returns_first_match() {
        let a: Arc<dyn ToolProvider> = Arc::new(StubProvider(vec!["add"]));
        let agg = Aggregator::new(vec![a]);
        let tool = agg.get_tool("add").await.unwrap();
        assert!(tool.is_some());
        let missing = agg.get_tool("missing").await.unwrap();
        assert!(missing.is_none());
    }
}
