//! # Analysis Engine
//!
//! The deterministic pipeline that turns a namespace graph into validated
//! flow analyses.
//!
//! ## Flow
//!
//! ```text
//! StructureResult → partition → split → fan-out (model calls) → validate/retry → analyses
//! ```
//!
//! `agent` and `tools` hold the alternative root-model tool loop.

pub mod agent;
pub mod cost;
pub mod events;
pub mod gate;
pub mod partition;
pub mod pipeline;
pub mod schema;
pub mod split;
pub mod tools;

/// Namespace name -> full source text
pub type SourceMap = std::collections::BTreeMap<String, String>;

pub use agent::{AgentEngine, AgentResult, AgentStatus, Step};
pub use cost::{CostSummary, CostTracker, GuardrailStatus};
pub use events::{PipelineEvent, PipelineEventKind};
pub use gate::{estimate_source_tokens, estimate_tokens, route_task, GateDecision, GateStage};
pub use partition::{partition, partition_flow_groups, FlowGroup};
pub use pipeline::{GroupError, PipelineResult, PipelineRunner, PipelineStatus};
pub use schema::{extract_json, validate, validate_value, ValidatedAnalysis, ValidationError};
pub use split::{split_oversized, DEFAULT_MAX_SOURCE_CHARS};
pub use tools::{ToolRegistry, ToolSpec};
