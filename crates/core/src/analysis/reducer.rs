//! # Reducer
//!
//! Turns validated flow analyses into beads. Purely mechanical: tags come
//! from fields of the analysis, links come from data-flow edges that cross
//! flow boundaries. No model calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::engine::schema::ValidatedAnalysis;
use crate::tools::beads::{BeadStore, Relation};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReduceResult {
    /// Beads created
    pub created_count: usize,
    /// Successful depends-on links
    pub links_created: usize,
    /// Tags confirmed by the tag call
    pub tags_applied: usize,
    /// Flow name -> bead id
    pub id_map: BTreeMap<String, String>,
    /// Flows whose bead could not be created
    pub failed: Vec<String>,
}

/// Lower-case and replace anything outside `[a-z0-9_-]` with `-`
pub fn normalize_tag(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Tags for one analysis, sorted
pub fn derive_tags(analysis: &ValidatedAnalysis) -> Vec<String> {
    let mut tags = BTreeSet::from(["structure".to_string()]);
    let mut add = |prefix: &str, raw: &str| {
        let fragment = normalize_tag(raw);
        if !fragment.is_empty() {
            tags.insert(format!("{}{}", prefix, fragment));
        }
    };

    for ns in analysis.namespaces() {
        if let Some(layer) = ns.get("layer").and_then(Value::as_str) {
            add("diplomat-", layer);
        }
        match ns.get("side_effects") {
            Some(Value::Array(effects)) => {
                for effect in effects.iter().filter_map(Value::as_str) {
                    add("has-", effect);
                }
            }
            Some(Value::Bool(true)) => add("has-", "side-effects"),
            Some(Value::String(effect)) => add("has-", effect),
            _ => {}
        }
        if is_present(ns.get("security_notes")) {
            add("has-", "security-notes");
        }
    }
    if !analysis.security_findings().is_empty() {
        add("has-", "security-findings");
    }
    if !analysis.bottlenecks().is_empty() {
        add("has-", "bottlenecks");
    }
    tags.into_iter().collect()
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Materialize `analyses` as beads in `store`
pub async fn reduce(analyses: &[ValidatedAnalysis], store: &dyn BeadStore) -> ReduceResult {
    let mut result = ReduceResult::default();
    let mut bead_ids: Vec<Option<String>> = Vec::with_capacity(analyses.len());

    for analysis in analyses {
        let flow = analysis.flow_name();
        let tags = derive_tags(analysis);
        let body = serde_json::to_string_pretty(analysis.as_map()).unwrap_or_default();

        let id = match store.create(flow, &body, &tags).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(flow = %flow, error = %e, "Failed to create bead");
                result.failed.push(flow.to_string());
                bead_ids.push(None);
                continue;
            }
        };
        tracing::info!(flow = %flow, bead = %id, tags = tags.len(), "Created bead");
        result.created_count += 1;
        result
            .id_map
            .entry(flow.to_string())
            .or_insert_with(|| id.clone());

        match store.tag(&id, &tags).await {
            Ok(true) => result.tags_applied += tags.len(),
            Ok(false) => tracing::warn!(bead = %id, "Some tags were not applied"),
            Err(e) => tracing::warn!(bead = %id, error = %e, "Tagging failed"),
        }
        bead_ids.push(Some(id));
    }

    // namespace -> index of the first analysis that lists it
    let mut owner: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, analysis) in analyses.iter().enumerate() {
        for name in analysis.namespace_names() {
            owner.entry(name).or_insert(idx);
        }
    }

    let mut linked = BTreeSet::new();
    for (idx, analysis) in analyses.iter().enumerate() {
        let Some(from_id) = &bead_ids[idx] else {
            continue;
        };
        for edge in analysis.data_flow() {
            let Some(target) = edge.get("to").and_then(Value::as_str) else {
                continue;
            };
            let Some(&target_idx) = owner.get(target) else {
                continue;
            };
            if target_idx == idx || !linked.insert((idx, target_idx)) {
                continue;
            }
            let Some(to_id) = &bead_ids[target_idx] else {
                continue;
            };
            match store.link(from_id, to_id, Relation::DependsOn).await {
                Ok(true) => result.links_created += 1,
                Ok(false) => tracing::warn!(from = %from_id, to = %to_id, "Link refused"),
                Err(e) => tracing::warn!(from = %from_id, to = %to_id, error = %e, "Link failed"),
            }
        }
    }

    tracing::info!(
        created = result.created_count,
        links = result.links_created,
        failed = result.failed.len(),
        "Reduction finished"
    );
    result
}
