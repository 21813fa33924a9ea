//! Wraps parsed [`Operation`]s as tools executed over HTTP (spec §4.2, C2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::{AgentError, Result};
use crate::run::AuthSpec;
use crate::tool::{DynTool, Tool, ToolDefinition, ToolError, ToolParameter, ToolProvider};

use super::auth::apply_auth;
use super::parser::{Operation, OpenApiParser, ParameterLocation};

/// Default per-call tool HTTP timeout (spec §5 "External tool calls MUST
/// respect per-call timeouts (default 30 s; configurable)").
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction-time configuration for an [`OpenApiConnector`] (spec §4.2).
pub struct ConnectorOptions {
    pub base_url: String,
    /// Statically configured auth; overridden per-request by
    /// `RunConfig::request_auth_overrides[source_id]` when present (spec
    /// §4.2 step 5).
    pub static_auth: AuthSpec,
    /// The `provider_id` key this connector is addressed by in
    /// `request_auth_overrides`.
    pub source_id: String,
    pub tag_filter: Option<String>,
    /// Expose `genericHttpRequest`; only takes effect when `tag_filter` is
    /// unset (spec §4.2).
    pub include_generic_http_tool: bool,
    /// Per-call HTTP timeout applied to every request this connector issues
    /// (spec §5). Defaults to [`DEFAULT_TOOL_TIMEOUT`] via
    /// [`ConnectorOptions::default_timeout`].
    pub request_timeout: Duration,
}

impl ConnectorOptions {
    /// [`DEFAULT_TOOL_TIMEOUT`], for callers that don't need a custom one.
    #[must_use]
    pub const fn default_timeout() -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// [`ToolProvider`] over one OpenAPI document: one tool per operation, plus
/// an optional `genericHttpRequest` escape hatch (spec §4.2, C2).
pub struct OpenApiConnector {
    spec: Value,
    options: ConnectorOptions,
    client: reqwest::Client,
    tools: OnceCell<HashMap<String, Arc<dyn DynTool>>>,
}

impl OpenApiConnector {
    /// # Errors
    /// Returns [`AgentError::Configuration`] if `options.base_url` is not a
    /// valid absolute URL — caught here rather than on the first tool call.
    pub fn new(spec: Value, options: ConnectorOptions) -> Result<Self> {
        url::Url::parse(&options.base_url)
            .map_err(|err| AgentError::configuration(format!("invalid base_url '{}': {err}", options.base_url)))?;
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|err| AgentError::configuration(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            spec,
            options,
            client,
            tools: OnceCell::new(),
        })
    }

    /// The `provider_id` this connector is addressed by in
    /// `RunConfig::request_auth_overrides`. Resolving an override against a
    /// run's config and folding the result into `ConnectorOptions::static_auth`
    /// is the caller's responsibility at construction time (spec §4.2 step
    /// 5) — by the time a connector is built for a run, `static_auth` already
    /// reflects that resolution, so tool execution never needs to consult
    /// the run config again.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.options.source_id
    }

    async fn build_tools(&self) -> Result<HashMap<String, Arc<dyn DynTool>>> {
        let parser = OpenApiParser::new(self.spec.clone(), self.options.tag_filter.clone())?;
        let mut tools: HashMap<String, Arc<dyn DynTool>> = HashMap::new();

        for operation in parser.operations() {
            let tool_name = crate::tool::sanitize_tool_name(&operation.operation_id);
            let tool = OperationTool {
                operation,
                base_url: self.options.base_url.clone(),
                auth: self.options.static_auth.clone(),
                client: self.client.clone(),
                tool_name: tool_name.clone(),
            };
            tools.insert(tool_name, Arc::new(tool));
        }

        if self.options.tag_filter.is_none() && self.options.include_generic_http_tool {
            let generic = GenericHttpRequestTool {
                base_url: self.options.base_url.clone(),
                auth: self.options.static_auth.clone(),
                client: self.client.clone(),
            };
            tools.insert("genericHttpRequest".to_string(), Arc::new(generic));
        }

        Ok(tools)
    }
}

#[async_trait]
impl ToolProvider for OpenApiConnector {
    async fn get_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.ensure_initialized().await?;
        let tools = self.tools.get().expect("initialized by ensure_initialized");
        Ok(tools.values().map(|t| t.definition()).collect())
    }

    async fn get_tool(&self, name: &str) -> Result<Option<Arc<dyn DynTool>>> {
        self.ensure_initialized().await?;
        let tools = self.tools.get().expect("initialized by ensure_initialized");
        Ok(tools.get(name).cloned())
    }

    /// Idempotent and deduplicated: concurrent callers share the single
    /// in-flight build via [`OnceCell::get_or_try_init`] (spec §4.2 "a
    /// single in-flight load is reused by concurrent callers").
    async fn ensure_initialized(&self) -> Result<()> {
        self.tools.get_or_try_init(|| self.build_tools()).await?;
        Ok(())
    }
}

/// One operation wrapped as a [`Tool`] (spec §4.2 `execute(input)`).
struct OperationTool {
    operation: Operation,
    base_url: String,
    auth: AuthSpec,
    client: reqwest::Client,
    tool_name: String,
}

#[async_trait]
impl Tool for OperationTool {
    fn definition(&self) -> ToolDefinition {
        let schema = self.operation.parameter_schema();
        let mut def = ToolDefinition::new(
            self.tool_name.clone(),
            self.operation
                .summary
                .clone()
                .unwrap_or_else(|| format!("{} {}", self.operation.method.to_uppercase(), self.operation.path)),
        );
        if let (Some(properties), Some(required)) = (schema["properties"].as_object(), schema["required"].as_array()) {
            let required: Vec<&str> = required.iter().filter_map(Value::as_str).collect();
            for (name, frag) in properties {
                let description = frag
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                def = def.with_parameter(
                    ToolParameter::new(name.clone(), "object", description, required.contains(&name.as_str()))
                        .with_schema(frag.clone()),
                );
            }
        }
        def
    }

    async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
        let result = execute_operation(
            &self.client,
            &self.base_url,
            &self.operation.method,
            &self.operation.path,
            &self.operation.parameters,
            &args,
            &self.auth,
        )
        .await;
        Ok(serde_json::to_value(result).map_err(ToolError::from)?)
    }
}

/// The `genericHttpRequest` escape hatch (spec §4.2): arbitrary method/path
/// within the connector's base URL, same auth/execution semantics as a
/// wrapped operation.
struct GenericHttpRequestTool {
    base_url: String,
    auth: AuthSpec,
    client: reqwest::Client,
}

#[async_trait]
impl Tool for GenericHttpRequestTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "genericHttpRequest",
            "Issue an arbitrary HTTP request against this connector's base URL",
        )
        .with_parameter(ToolParameter::new("method", "string", "HTTP method", true))
        .with_parameter(ToolParameter::new("path", "string", "request path", true))
        .with_parameter(ToolParameter::new("query_params", "object", "query parameters", false))
        .with_parameter(ToolParameter::new("headers", "object", "request headers", false))
        .with_parameter(ToolParameter::new("request_body", "object", "JSON request body", false))
    }

    async fn call(&self, args: Value) -> std::result::Result<Value, ToolError> {
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::message("'method' is required"))?
            .to_string();
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::message("'path' is required"))?
            .to_string();

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self
            .client
            .request(parse_method(&method)?, &url)
            .header("Content-Type", "application/json");
        builder = apply_auth(builder, &self.auth);

        if let Some(query) = args.get("query_params").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), value_to_query_string(v)))
                .collect();
            builder = builder.query(&pairs);
        }
        if let Some(headers) = args.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    builder = builder.header(key, value);
                }
            }
        }
        if let Some(body) = args.get("request_body") {
            builder = builder.json(body);
        }

        let result = send_and_normalize(builder).await;
        Ok(serde_json::to_value(result).map_err(ToolError::from)?)
    }
}

fn parse_method(method: &str) -> std::result::Result<reqwest::Method, ToolError> {
    method
        .parse()
        .map_err(|_| ToolError::message(format!("invalid HTTP method '{method}'")))
}

fn value_to_query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_operation(
    client: &reqwest::Client,
    base_url: &str,
    method: &str,
    path_template: &str,
    parameters: &[super::parser::Parameter],
    args: &Value,
    auth: &AuthSpec,
) -> ToolResultPayload {
    let method = match parse_method(method) {
        Ok(m) => m,
        Err(err) => return ToolResultPayload::error(format!("invalid method: {err}")),
    };

    let path = substitute_path_parameters(path_template, parameters, args);
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut builder = client.request(method, &url);
    builder = apply_auth(builder, auth);

    for param in parameters {
        let Some(value) = args.get(&param.name) else { continue };
        match param.location {
            ParameterLocation::Path => {}
            ParameterLocation::Query => {
                builder = apply_query_parameter(builder, &param.name, value, param.explode);
            }
            ParameterLocation::Header => {
                if let Some(s) = value.as_str() {
                    builder = builder.header(&param.name, s);
                } else {
                    builder = builder.header(&param.name, value.to_string());
                }
            }
            ParameterLocation::Cookie => {
                builder = builder.header("Cookie", format!("{}={}", param.name, value_to_query_string(value)));
            }
        }
    }

    if let Some(body) = args.get("requestBody") {
        builder = builder.header("Content-Type", "application/json").json(body);
    }

    send_and_normalize(builder).await
}

fn apply_query_parameter(
    builder: reqwest::RequestBuilder,
    name: &str,
    value: &Value,
    explode: bool,
) -> reqwest::RequestBuilder {
    if let Value::Array(items) = value {
        if explode {
            let pairs: Vec<(String, String)> = items
                .iter()
                .map(|item| (name.to_string(), value_to_query_string(item)))
                .collect();
            return builder.query(&pairs);
        }
        let joined = items.iter().map(value_to_query_string).collect::<Vec<_>>().join(",");
        return builder.query(&[(name, joined)]);
    }
    builder.query(&[(name, value_to_query_string(value))])
}

/// URI-encode each path segment in isolation so that a `/` inside a
/// parameter value cannot be mistaken for a path separator (spec §4.2 step 1
/// "component-wise").
fn substitute_path_parameters(template: &str, parameters: &[super::parser::Parameter], args: &Value) -> String {
    let mut path = template.to_string();
    for param in parameters {
        if param.location != ParameterLocation::Path {
            continue;
        }
        let placeholder = format!("{{{}}}", param.name);
        let raw = args
            .get(&param.name)
            .map(value_to_query_string)
            .unwrap_or_default();
        path = path.replace(&placeholder, &percent_encode_path_segment(&raw));
    }
    path
}

/// Percent-encode a single path segment, including `/`, per RFC 3986
/// `pchar` minus the reserved `/`.
fn percent_encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, serde::Serialize)]
struct ToolResultPayload {
    success: bool,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    attributes: Value,
}

impl ToolResultPayload {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
            attributes: Value::Null,
        }
    }
}

/// Issue the request; categorize network/parse/timeout failures into
/// `success=false` rather than letting them propagate as an error (spec §4.2
/// step 7 "they are not thrown").
async fn send_and_normalize(builder: reqwest::RequestBuilder) -> ToolResultPayload {
    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            let category = if err.is_timeout() {
                "timeout"
            } else if err.is_connect() {
                "connect_error"
            } else {
                "network_error"
            };
            return ToolResultPayload::error(format!("{category}: {err}"));
        }
    };

    let status = response.status();
    let headers: Value = Value::Object(
        response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), Value::String(v.to_string()))))
            .collect(),
    );
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body_text = match response.text().await {
        Ok(text) => text,
        Err(err) => return ToolResultPayload::error(format!("parse_error: {err}")),
    };

    let data = if content_type.contains("json") {
        serde_json::from_str::<Value>(&body_text).unwrap_or(Value::String(body_text))
    } else {
        Value::String(body_text)
    };

    ToolResultPayload {
        success: status.is_success(),
        data,
        error: if status.is_success() {
            None
        } else {
            Some(format!("HTTP {status}"))
        },
        attributes: serde_json::json!({ "status": status.as_u16(), "headers": headers }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> Value {
        serde_json::json!({
            "openapi": "3.0.0",
            "paths": {
                "/pets/{id}": {
                    "get": {
                        "operationId": "getPet",
                        "parameters": [
                            {"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}
                        ],
                        "responses": {}
                    }
                }
            }
        })
    }

    fn options(tag_filter: Option<String>, include_generic: bool) -> ConnectorOptions {
        ConnectorOptions {
            base_url: "https://api.example.com".to_string(),
            static_auth: AuthSpec::None,
            source_id: "petstore".to_string(),
            tag_filter,
            include_generic_http_tool: include_generic,
            request_timeout: ConnectorOptions::default_timeout(),
        }
    }

    #[tokio::test]
    async fn operation_is_exposed_as_a_sanitized_tool_name() {
        let connector = OpenApiConnector::new(sample_spec(), options(None, false)).unwrap();
        let tools = connector.get_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "getPet");
    }

    #[tokio::test]
    async fn generic_http_tool_is_excluded_when_tag_filter_is_set() {
        let connector = OpenApiConnector::new(sample_spec(), options(Some("pets".to_string()), true)).unwrap();
        let tools = connector.get_tools().await.unwrap();
        assert!(tools.iter().all(|t| t.name != "genericHttpRequest"));
    }

    #[tokio::test]
    async fn generic_http_tool_is_included_when_requested_and_no_tag_filter() {
        let connector = OpenApiConnector::new(sample_spec(), options(None, true)).unwrap();
        let tools = connector.get_tools().await.unwrap();
        assert!(tools.iter().any(|t| t.name == "genericHttpRequest"));
    }

    #[test]
    fn default_tool_timeout_is_thirty_seconds() {
        assert_eq!(ConnectorOptions::default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn a_custom_request_timeout_is_accepted_at_construction() {
        let mut opts = options(None, false);
        opts.request_timeout = Duration::from_secs(5);
        assert!(OpenApiConnector::new(sample_spec(), opts).is_ok());
    }

    #[tokio::test]
    async fn ensure_initialized_is_idempotent_across_concurrent_callers() {
        let connector = Arc::new(OpenApiConnector::new(sample_spec(), options(None, false)).unwrap());
        let a = connector.clone();
        let b = connector.clone();
        let (r1, r2) = tokio::join!(a.ensure_initialized(), b.ensure_initialized());
        r1.unwrap();
        r2.unwrap();
        assert_eq!(connector.get_tools().await.unwrap().len(), 1);
    }

    #[test]
    fn path_parameters_are_substituted_component_wise() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        let op = parser.operations().into_iter().next().unwrap();
        let path = substitute_path_parameters(&op.path, &op.parameters, &serde_json::json!({"id": "a/b"}));
        assert_eq!(path, "/pets/a%2Fb");
    }

    #[tokio::test]
    async fn get_tool_returns_none_for_unknown_name() {
        let connector = OpenApiConnector::new(sample_spec(), options(None, false)).unwrap();
        assert!(connector.get_tool("missing").await.unwrap().is_none());
    }

    #[test]
    fn malformed_base_url_is_rejected_at_construction() {
        let mut opts = options(None, false);
        opts.base_url = "not a url".to_string();
        let err = OpenApiConnector::new(sample_spec(), opts).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
