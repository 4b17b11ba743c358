//! # Pipeline Events
//!
//! Progress events a pipeline run streams to an optional listener.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of pipeline event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Fan-out is about to start
    PipelineStarted,
    /// A group's model call was handed to a worker
    GroupDispatched,
    /// A group produced a validated analysis
    GroupCompleted,
    /// A group was recorded as a permanent error
    GroupFailed,
    /// A group is being retried after failed validation
    GroupRetried,
    /// Spend crossed the warning threshold
    BudgetWarning,
    /// A guardrail tripped; remaining work is cancelled
    BudgetExceeded,
    PipelineCompleted,
}

/// An event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    /// Dispatch-level group the event concerns, if any
    #[serde(default)]
    pub group: Option<String>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: event_id(),
            timestamp: Utc::now(),
            kind,
            group: None,
            data: None,
        }
    }

    pub fn for_group(kind: PipelineEventKind, group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Self::new(kind)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Time-ordered event id: nanosecond timestamp plus a random suffix
fn event_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let salt = RandomState::new().build_hasher().finish() as u32;
    format!("{:x}-{:x}", nanos, salt)
}
