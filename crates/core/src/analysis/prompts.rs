//! Prompt templates bundled at compile time, and the builders that fill
//! them in for one flow group.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::str::FromStr;

use crate::engine::partition::FlowGroup;
use crate::engine::schema::analysis_json_schema;
use crate::engine::SourceMap;

/// Flow analyst - system prompt for every fan-out call
pub const FLOW_ANALYSIS: &str = include_str!("templates/flow_analysis.md");

/// Extra instructions for security-mode runs
pub const SECURITY_ADDENDUM: &str = include_str!("templates/security_addendum.md");

/// Root analyst - system prompt for the tool loop
pub const AGENT_SYSTEM: &str = include_str!("templates/agent_system.md");

/// What a run asks the model to look for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Structure,
    Security,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Structure => "structure",
            AnalysisMode::Security => "security",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "structure" => Ok(AnalysisMode::Structure),
            "security" => Ok(AnalysisMode::Security),
            other => Err(format!("unknown analysis mode '{}'", other)),
        }
    }
}

const EXAMPLE_RESPONSE: &str = r#"{
  "flow_name": "order-placement",
  "entry_points": ["svc.model.order"],
  "exit_points": ["svc.controller.orders"],
  "namespaces": [
    {
      "name": "svc.controller.orders",
      "layer": "controller",
      "role": "Validates the request and persists the order",
      "side_effects": ["datomic", "kafka"],
      "security_notes": "Amount is not range-checked before persisting"
    }
  ],
  "data_flow": [
    {
      "from": "svc.adapter.orders",
      "to": "svc.controller.orders",
      "transforms": "wire order -> internal order model"
    }
  ],
  "bottlenecks": ["Synchronous HTTP call to pricing inside a transaction"],
  "security_findings": ["Unvalidated amount reaches datomic transact"],
  "coupling_issues": []
}"#;

/// Build the analysis prompt for one dispatch-level flow group
pub fn flow_group_prompt(group: &FlowGroup, sources: &SourceMap, mode: AnalysisMode) -> String {
    let mut prompt = String::new();

    let heading = match mode {
        AnalysisMode::Structure => "Analyze flow group",
        AnalysisMode::Security => "Security review of flow group",
    };
    let _ = writeln!(prompt, "# {}: {}\n", heading, group.name);

    let _ = writeln!(prompt, "## Entry points");
    push_list(&mut prompt, &group.entry_points);
    let _ = writeln!(prompt, "\n## Exit points");
    push_list(&mut prompt, &group.exit_points);

    let _ = writeln!(prompt, "\n## Namespaces ({})", group.len());
    let mut members: Vec<_> = group.namespaces.iter().collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    for ns in &members {
        let _ = writeln!(prompt, "- {} ({})", ns.name, ns.layer);
    }

    let _ = writeln!(prompt, "\n## Internal dependencies");
    if group.internal_deps.is_empty() {
        let _ = writeln!(prompt, "(none)");
    }
    for (from, deps) in &group.internal_deps {
        for to in deps {
            let _ = writeln!(prompt, "- {} depends on {}", from, to);
        }
    }

    let _ = writeln!(prompt, "\n## Source");
    for ns in &members {
        let _ = writeln!(prompt, "\n### {} ({})", ns.name, ns.path.display());
        match sources.get(&ns.name) {
            Some(source) => {
                let _ = writeln!(prompt, "```clojure\n{}\n```", source.trim_end());
            }
            None => {
                let _ = writeln!(prompt, "(source not available)");
            }
        }
    }

    if mode == AnalysisMode::Security {
        let _ = writeln!(prompt, "\n{}", SECURITY_ADDENDUM.trim_end());
    }

    let schema = serde_json::to_string_pretty(&analysis_json_schema()).unwrap_or_default();
    let _ = writeln!(prompt, "\n## Response format\n");
    let _ = writeln!(
        prompt,
        "Return one JSON object shaped like this example:\n\n```json\n{}\n```\n",
        EXAMPLE_RESPONSE
    );
    let _ = writeln!(
        prompt,
        "It must conform to this JSON Schema:\n\n```json\n{}\n```",
        schema
    );

    prompt
}

/// Re-ask after a validation failure
pub fn retry_prompt(original: &str, error: &str) -> String {
    format!(
        "{}\n\nPrevious attempt failed validation: {}\n\
         Return only the corrected JSON object, including every required field.",
        original, error
    )
}

fn push_list(prompt: &mut String, items: &[String]) {
    if items.is_empty() {
        prompt.push_str("(none)\n");
    }
    for item in items {
        let _ = writeln!(prompt, "- {}", item);
    }
}
