//! # Codebase Analysis
//!
//! Project-level workflow on top of the engine: prompt building, context
//! loading, bead reduction, and the orchestrator that ties them together.

pub mod context;
pub mod orchestrator;
pub mod prompts;
pub mod reducer;

pub use context::{load_sources, CodebaseContext};
pub use orchestrator::{
    AnalysisPlan, AnalysisResult, AnalysisStatus, CodebaseAnalyzer, StalenessResult,
    StalenessStatus,
};
pub use prompts::AnalysisMode;
pub use reducer::{derive_tags, reduce, ReduceResult};
