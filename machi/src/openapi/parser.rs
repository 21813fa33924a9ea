//! The OpenAPI spec parser (spec §4.1, C1): resolves internal `$ref`s,
//! flattens operations across methods, applies an optional tag filter, and
//! derives a per-operation parameter schema.

use serde_json::Value;

use crate::error::{AgentError, Result};

const METHODS: &[&str] = &[
    "get", "post", "put", "delete", "patch", "options", "head", "trace",
];

/// Where a [`Parameter`] is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParameterLocation {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            _ => None,
        }
    }
}

/// One `parameters[]` entry of an operation, after `$ref` resolution.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub location: ParameterLocation,
    pub required: bool,
    pub description: Option<String>,
    pub schema: Value,
    /// `style=form, explode=true` array serialization (spec §4.2 step 2); only
    /// meaningful for `location == Query`.
    pub explode: bool,
}

/// A single flattened operation (spec §4.1).
#[derive(Debug, Clone)]
pub struct Operation {
    pub method: String,
    pub path: String,
    pub operation_id: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub parameters: Vec<Parameter>,
    pub request_body_schema: Option<Value>,
    pub request_body_required: bool,
}

impl Operation {
    /// The JSON-Schema object derived for this operation's combined input
    /// (spec §4.1 "Derived operation parameter schema"): `properties` one
    /// entry per parameter (annotated with a description if the spec's own
    /// schema fragment lacks one) plus, when a request body exists, a
    /// `requestBody` property; `required` is the sorted list of required
    /// parameter names, with `requestBody` appended iff the spec marked it
    /// required.
    #[must_use]
    pub fn parameter_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut schema = param.schema.clone();
            if let Value::Object(map) = &mut schema {
                if !map.contains_key("description") {
                    if let Some(desc) = &param.description {
                        map.insert("description".to_string(), Value::String(desc.clone()));
                    }
                }
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(param.name.clone());
            }
        }

        if let Some(body_schema) = &self.request_body_schema {
            properties.insert("requestBody".to_string(), body_schema.clone());
            if self.request_body_required {
                required.push("requestBody".to_string());
            }
        }

        required.sort();
        serde_json::json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }
}

/// Parses an OpenAPI document into a flat, ordered list of [`Operation`]s
/// (spec §4.1, C1).
pub struct OpenApiParser {
    spec: Value,
    tag_filter: Option<String>,
}

impl OpenApiParser {
    /// # Errors
    /// Returns [`AgentError::Configuration`] if `spec` lacks `openapi` or `paths`.
    pub fn new(spec: Value, tag_filter: Option<String>) -> Result<Self> {
        if spec.get("openapi").is_none() {
            return Err(AgentError::configuration("OpenAPI document missing 'openapi' field"));
        }
        if spec.get("paths").is_none() {
            return Err(AgentError::configuration("OpenAPI document missing 'paths' field"));
        }
        Ok(Self { spec, tag_filter })
    }

    /// Every distinct tag referenced by any operation, in first-seen order
    /// (spec §4.9 "list all tags from the spec parser").
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for op in self.operations_unfiltered() {
            for tag in op.tags {
                if !seen.contains(&tag) {
                    seen.push(tag);
                }
            }
        }
        seen
    }

    /// Flatten every path/method into an [`Operation`], applying the tag
    /// filter configured at construction (spec §4.1).
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        let ops = self.operations_unfiltered();
        match &self.tag_filter {
            None => ops,
            Some(tag) => ops.into_iter().filter(|op| op.tags.contains(tag)).collect(),
        }
    }

    fn operations_unfiltered(&self) -> Vec<Operation> {
        let mut out = Vec::new();
        let Some(paths) = self.spec.get("paths").and_then(Value::as_object) else {
            return out;
        };

        for (path, path_item_raw) in paths {
            let Some(path_item) = self.resolve(path_item_raw) else {
                continue;
            };
            let Some(path_item) = path_item.as_object() else {
                continue;
            };
            let path_level_params = path_item
                .get("parameters")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for method in METHODS {
                let Some(op_raw) = path_item.get(*method) else {
                    continue;
                };
                let Some(op_value) = self.resolve(op_raw) else {
                    continue;
                };
                let Some(op_obj) = op_value.as_object() else {
                    continue;
                };

                let Some(operation_id) = op_obj.get("operationId").and_then(Value::as_str) else {
                    tracing::warn!(path = %path, method = %method, "operation has no operationId, skipping");
                    continue;
                };

                let tags: Vec<String> = op_obj
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let mut raw_params = path_level_params.clone();
                if let Some(op_params) = op_obj.get("parameters").and_then(Value::as_array) {
                    raw_params.extend(op_params.iter().cloned());
                }
                let parameters = raw_params
                    .iter()
                    .filter_map(|p| self.resolve_parameter(p))
                    .collect();

                let (request_body_schema, request_body_required) = op_obj
                    .get("requestBody")
                    .and_then(|rb| self.resolve(rb))
                    .map_or((None, false), |rb| self.extract_request_body(&rb));

                out.push(Operation {
                    method: (*method).to_string(),
                    path: path.clone(),
                    operation_id: operation_id.to_string(),
                    summary: op_obj.get("summary").and_then(Value::as_str).map(ToString::to_string),
                    tags,
                    parameters,
                    request_body_schema,
                    request_body_required,
                });
            }
        }
        out
    }

    fn resolve_parameter(&self, raw: &Value) -> Option<Parameter> {
        let resolved = self.resolve(raw)?;
        let obj = resolved.as_object()?;
        let name = obj.get("name")?.as_str()?.to_string();
        let location = ParameterLocation::parse(obj.get("in")?.as_str()?)?;
        let required = obj.get("required").and_then(Value::as_bool).unwrap_or(false);
        let description = obj.get("description").and_then(Value::as_str).map(ToString::to_string);
        let schema = obj.get("schema").cloned().unwrap_or_else(|| serde_json::json!({"type": "string"}));
        let explode = obj.get("explode").and_then(Value::as_bool).unwrap_or(true);
        Some(Parameter {
            name,
            location,
            required,
            description,
            schema,
            explode,
        })
    }

    /// Extract the `application/json` media-type schema only (spec §4.1).
    fn extract_request_body(&self, request_body: &Value) -> (Option<Value>, bool) {
        let required = request_body
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let schema = request_body
            .get("content")
            .and_then(|c| c.get("application/json"))
            .and_then(|m| m.get("schema"))
            .and_then(|s| self.resolve(s));
        (schema, required)
    }

    /// Resolve a single `$ref` hop if present, else return the value as-is.
    /// Internal refs only (prefix `#/`); external refs are refused (spec
    /// §4.1 "External refs are refused (return null)"). Implementations MAY
    /// detect cycles; this one bounds the hop count instead of tracking a
    /// visited set, which is sufficient for the depth any real document nests.
    fn resolve(&self, value: &Value) -> Option<Value> {
        let mut current = value.clone();
        for _ in 0..32 {
            let Some(ref_str) = current.get("$ref").and_then(Value::as_str) else {
                return Some(current);
            };
            if !ref_str.starts_with("#/") {
                return None;
            }
            current = self.resolve_pointer(ref_str)?;
        }
        None
    }

    fn resolve_pointer(&self, pointer: &str) -> Option<Value> {
        let mut node = &self.spec;
        for raw_token in pointer.trim_start_matches("#/").split('/') {
            let token = unescape_json_pointer_token(raw_token);
            node = match node {
                Value::Object(map) => map.get(&token)?,
                Value::Array(arr) => arr.get(token.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node.clone())
    }
}

/// `~1` -> `/`, `~0` -> `~` (spec §4.1).
fn unescape_json_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> Value {
        serde_json::json!({
            "openapi": "3.0.0",
            "paths": {
                "/pets/{id}": {
                    "parameters": [
                        {"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}
                    ],
                    "get": {
                        "operationId": "getPet",
                        "tags": ["pets"],
                        "responses": {}
                    },
                    "delete": {
                        "operationId": "deletePet",
                        "tags": ["pets", "admin"],
                        "responses": {}
                    }
                },
                "/pets": {
                    "post": {
                        "operationId": "createPet",
                        "tags": ["pets"],
                        "requestBody": {
                            "required": true,
                            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Pet"}}}
                        },
                        "responses": {}
                    }
                },
                "/unnamed": {
                    "get": { "responses": {} }
                }
            },
            "components": {
                "schemas": {
                    "Pet": {"type": "object", "properties": {"name": {"type": "string"}}}
                }
            }
        })
    }

    #[test]
    fn missing_openapi_field_is_a_configuration_error() {
        let err = OpenApiParser::new(serde_json::json!({"paths": {}}), None).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn operations_without_operation_id_are_skipped() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        let ops = parser.operations();
        assert!(ops.iter().all(|op| op.operation_id != "unnamed"));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn path_level_parameters_are_inherited_by_every_method() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        let get_pet = parser.operations().into_iter().find(|o| o.operation_id == "getPet").unwrap();
        assert_eq!(get_pet.parameters.len(), 1);
        assert_eq!(get_pet.parameters[0].name, "id");
        assert!(get_pet.parameters[0].required);
    }

    #[test]
    fn tag_filter_excludes_non_matching_operations() {
        let parser = OpenApiParser::new(sample_spec(), Some("admin".to_string())).unwrap();
        let ops = parser.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation_id, "deletePet");
    }

    #[test]
    fn tags_lists_every_distinct_tag_in_first_seen_order() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        assert_eq!(parser.tags(), vec!["pets".to_string(), "admin".to_string()]);
    }

    #[test]
    fn request_body_ref_is_resolved_and_marked_required() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        let create_pet = parser.operations().into_iter().find(|o| o.operation_id == "createPet").unwrap();
        let schema = create_pet.request_body_schema.unwrap();
        assert_eq!(schema["properties"]["name"]["type"], "string");
        assert!(create_pet.request_body_required);
    }

    #[test]
    fn parameter_schema_includes_request_body_in_required_when_marked() {
        let parser = OpenApiParser::new(sample_spec(), None).unwrap();
        let create_pet = parser.operations().into_iter().find(|o| o.operation_id == "createPet").unwrap();
        let schema = create_pet.parameter_schema();
        assert!(schema["properties"]["requestBody"].is_object());
        assert_eq!(schema["required"], serde_json::json!(["requestBody"]));
    }

    #[test]
    fn external_refs_are_refused() {
        let spec = serde_json::json!({
            "openapi": "3.0.0",
            "paths": {
                "/x": { "$ref": "external.yaml#/paths/~1x" }
            }
        });
        let parser = OpenApiParser::new(spec, None).unwrap();
        assert!(parser.operations().is_empty());
    }

    #[test]
    fn json_pointer_tokens_are_unescaped() {
        assert_eq!(unescape_json_pointer_token("a~1b~0c"), "a/b~c");
    }
}
