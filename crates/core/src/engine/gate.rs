//! Decision gate: send work to a single direct call, or fan it out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rough characters per token for source code
pub const CHARS_PER_TOKEN: usize = 4;

/// Which rule made the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Threshold,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub fan_out: bool,
    pub token_count: usize,
    pub stage: GateStage,
    pub reason: String,
}

/// Estimate the token count of a text
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the token count of every source in a map
pub fn estimate_source_tokens(sources: &BTreeMap<String, String>) -> usize {
    sources.values().map(|s| estimate_tokens(s)).sum()
}

/// Route a task of `token_count` tokens.
///
/// An explicit override wins; otherwise work at or above `threshold` fans out.
pub fn route_task(token_count: usize, force: Option<bool>, threshold: usize) -> GateDecision {
    if let Some(fan_out) = force {
        return GateDecision {
            fan_out,
            token_count,
            stage: GateStage::Override,
            reason: format!(
                "caller forced {} execution",
                if fan_out { "fan-out" } else { "direct" }
            ),
        };
    }

    let fan_out = token_count >= threshold;
    GateDecision {
        fan_out,
        token_count,
        stage: GateStage::Threshold,
        reason: if fan_out {
            format!("{} tokens >= threshold {}", token_count, threshold)
        } else {
            format!("{} tokens < threshold {}", token_count, threshold)
        },
    }
}
