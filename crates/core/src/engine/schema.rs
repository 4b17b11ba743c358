//! # Schema Validator
//!
//! Parses a model's raw reply into a flow analysis and checks the required
//! shape. Model output is unreliable about wrapping, so JSON is looked for
//! in a fenced block first, then in the first `{...}` span, then in the raw
//! text itself.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// Top-level fields every flow analysis must carry
pub const REQUIRED_FIELDS: [&str; 8] = [
    "flow_name",
    "entry_points",
    "exit_points",
    "namespaces",
    "data_flow",
    "bottlenecks",
    "security_findings",
    "coupling_issues",
];

/// Fields every `namespaces[]` entry must carry
pub const NAMESPACE_FIELDS: [&str; 5] = ["name", "layer", "role", "side_effects", "security_notes"];

/// Fields every `data_flow[]` entry must carry
pub const DATA_FLOW_FIELDS: [&str; 3] = ["from", "to", "transforms"];

/// Why a model reply was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("field '{0}' must be an array")]
    NotAnArray(&'static str),

    #[error("{section}[{index}] is not an object")]
    EntryNotObject { section: &'static str, index: usize },

    #[error("{section}[{index}] missing required fields: {}", .missing.join(", "))]
    EntryMissingFields {
        section: &'static str,
        index: usize,
        missing: Vec<String>,
    },
}

/// A flow analysis that passed validation.
///
/// Holds the model's object as-is; unknown fields are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatedAnalysis(Map<String, Value>);

impl ValidatedAnalysis {
    pub fn flow_name(&self) -> &str {
        self.0
            .get("flow_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> &[Value] {
        self.array("namespaces")
    }

    pub fn data_flow(&self) -> &[Value] {
        self.array("data_flow")
    }

    pub fn security_findings(&self) -> &[Value] {
        self.array("security_findings")
    }

    pub fn bottlenecks(&self) -> &[Value] {
        self.array("bottlenecks")
    }

    /// Names of the namespaces this analysis covers
    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces()
            .iter()
            .filter_map(|ns| ns.get("name").and_then(Value::as_str))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn array(&self, field: &str) -> &[Value] {
        self.0
            .get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Pull the most likely JSON payload out of a model reply
pub fn extract_json(raw: &str) -> &str {
    static FENCED: OnceLock<Option<Regex>> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```(?:json)?[ \t]*\r?\n(.*?)```").ok());

    // Only `json` or untagged fences count, and only if they hold an object
    if let Some(re) = fenced.as_ref() {
        let body = re
            .captures_iter(raw)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .find(|body| body.starts_with('{'));
        if let Some(body) = body {
            return body;
        }
    }

    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            return &raw[start..=end];
        }
    }

    raw.trim()
}

/// Parse and validate a raw model reply
pub fn validate(raw: &str) -> Result<ValidatedAnalysis, ValidationError> {
    let text = extract_json(raw);
    let value: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    validate_value(value)
}

/// Validate an already-parsed value
pub fn validate_value(value: Value) -> Result<ValidatedAnalysis, ValidationError> {
    let map = match value {
        Value::Object(map) => map,
        other => return Err(ValidationError::NotAnObject(kind_of(&other))),
    };

    let missing = missing_fields(&map, &REQUIRED_FIELDS);
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    check_entries(&map, "namespaces", &NAMESPACE_FIELDS)?;
    check_entries(&map, "data_flow", &DATA_FLOW_FIELDS)?;

    Ok(ValidatedAnalysis(map))
}

fn check_entries(
    map: &Map<String, Value>,
    section: &'static str,
    required: &[&str],
) -> Result<(), ValidationError> {
    let entries = map
        .get(section)
        .and_then(Value::as_array)
        .ok_or(ValidationError::NotAnArray(section))?;

    for (index, entry) in entries.iter().enumerate() {
        let obj = entry
            .as_object()
            .ok_or(ValidationError::EntryNotObject { section, index })?;
        let missing = missing_fields(obj, required);
        if !missing.is_empty() {
            return Err(ValidationError::EntryMissingFields {
                section,
                index,
                missing,
            });
        }
    }
    Ok(())
}

fn missing_fields(map: &Map<String, Value>, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|field| !map.contains_key(**field))
        .map(|field| field.to_string())
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Prompt-facing document shape
// ============================================================================

/// Analysis of one namespace within a flow
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamespaceAnalysis {
    /// Fully qualified namespace name
    pub name: String,
    /// One of adapter, controller, logic, model, wire, unknown
    pub layer: String,
    /// What the namespace does in this flow
    pub role: String,
    /// Side-effecting systems touched (db, kafka, http, ...)
    pub side_effects: Vec<String>,
    /// Security observations, empty when none
    pub security_notes: String,
}

/// A data hand-off between two namespaces
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DataFlowEdge {
    pub from: String,
    pub to: String,
    /// How the data is transformed on the way
    pub transforms: String,
}

/// The document a model is asked to return for a flow group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowAnalysisDocument {
    pub flow_name: String,
    pub entry_points: Vec<String>,
    pub exit_points: Vec<String>,
    pub namespaces: Vec<NamespaceAnalysis>,
    pub data_flow: Vec<DataFlowEdge>,
    pub bottlenecks: Vec<String>,
    pub security_findings: Vec<String>,
    pub coupling_issues: Vec<String>,
}

/// JSON Schema of [`FlowAnalysisDocument`], embedded in analysis prompts
pub fn analysis_json_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(FlowAnalysisDocument)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete() -> Value {
        json!({
            "flow_name": "orders",
            "entry_points": ["svc.controller.orders"],
            "exit_points": ["svc.model.order"],
            "namespaces": [{
                "name": "svc.controller.orders",
                "layer": "controller",
                "role": "coordinates order placement",
                "side_effects": ["db"],
                "security_notes": ""
            }],
            "data_flow": [{
                "from": "svc.controller.orders",
                "to": "svc.model.order",
                "transforms": "wire -> model"
            }],
            "bottlenecks": [],
            "security_findings": ["unvalidated amount"],
            "coupling_issues": []
        })
    }

    #[test]
    fn test_fenced_json_matches_unwrapped() {
        let doc = complete();
        let raw = format!("Here you go:\n```json\n{}\n```\nDone.", doc);
        let analysis = validate(&raw).unwrap();
        assert_eq!(analysis.into_value(), doc);
    }

    #[test]
    fn test_bare_fence_and_brace_span() {
        let doc = complete();
        assert!(validate(&format!("```\n{}\n```", doc)).is_ok());
        assert!(validate(&format!("Analysis follows {} -- end", doc)).is_ok());
        assert!(validate(&doc.to_string()).is_ok());
    }

    #[test]
    fn test_tagged_source_fence_is_skipped() {
        let doc = complete();
        let raw = format!(
            "The hot path is:\n```clojure\n(ns svc.a)\n```\nResult:\n{}",
            doc
        );
        assert_eq!(extract_json(&raw), doc.to_string());
        assert_eq!(validate(&raw).unwrap().into_value(), doc);

        let both = format!("```clojure\n(ns svc.a)\n```\n```json\n{}\n```", doc);
        assert_eq!(validate(&both).unwrap().into_value(), doc);
    }

    #[test]
    fn test_unparseable_text() {
        let err = validate("I could not analyze this flow.").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidJson(_)));
    }

    #[test]
    fn test_not_an_object() {
        let err = validate("[1, 2, 3]").unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject("array"));
    }

    #[test]
    fn test_each_missing_top_level_field_is_named() {
        for field in REQUIRED_FIELDS {
            let mut doc = complete();
            doc.as_object_mut().unwrap().remove(field);
            let err = validate_value(doc).unwrap_err();
            assert!(err.to_string().contains(field), "{} not in '{}'", field, err);
        }
    }

    #[test]
    fn test_each_missing_namespace_field_is_named() {
        for field in NAMESPACE_FIELDS {
            let mut doc = complete();
            doc["namespaces"][0].as_object_mut().unwrap().remove(field);
            let err = validate_value(doc).unwrap_err();
            assert!(err.to_string().starts_with("namespaces[0]"));
            assert!(err.to_string().contains(field), "{} not in '{}'", field, err);
        }
    }

    #[test]
    fn test_each_missing_data_flow_field_is_named() {
        for field in DATA_FLOW_FIELDS {
            let mut doc = complete();
            doc["data_flow"][0].as_object_mut().unwrap().remove(field);
            let err = validate_value(doc).unwrap_err();
            assert!(err.to_string().starts_with("data_flow[0]"));
            assert!(err.to_string().contains(field), "{} not in '{}'", field, err);
        }
    }

    #[test]
    fn test_entry_must_be_object() {
        let mut doc = complete();
        doc["data_flow"] = json!(["a -> b"]);
        let err = validate_value(doc).unwrap_err();
        assert_eq!(
            err,
            ValidationError::EntryNotObject {
                section: "data_flow",
                index: 0
            }
        );
    }

    #[test]
    fn test_namespaces_must_be_array() {
        let mut doc = complete();
        doc["namespaces"] = json!({"name": "x"});
        assert_eq!(
            validate_value(doc).unwrap_err(),
            ValidationError::NotAnArray("namespaces")
        );
    }

    #[test]
    fn test_accessors() {
        let analysis = validate_value(complete()).unwrap();
        assert_eq!(analysis.flow_name(), "orders");
        assert_eq!(analysis.namespaces().len(), 1);
        assert_eq!(analysis.security_findings().len(), 1);
        assert!(analysis.bottlenecks().is_empty());
        let names: Vec<_> = analysis.namespace_names().collect();
        assert_eq!(names, vec!["svc.controller.orders"]);
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = analysis_json_schema();
        let required = schema["required"].as_array().unwrap();
        for field in REQUIRED_FIELDS {
            assert!(required.iter().any(|v| v == field), "{} not required", field);
        }
    }
}
