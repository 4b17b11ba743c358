//! # Beadloom Core
//!
//! Analyzes a Clojure codebase into a knowledge graph of "beads", one per
//! data-flow group of namespaces.
//!
//! ## Architecture
//!
//! - `structure` - Namespace graph data model
//! - `models` / `config` - Model registry, price table, engine configuration
//! - `llm` - Model client trait and the HTTP client
//! - `engine/` - Partitioning, splitting, validation, cost guardrails, fan-out
//! - `analysis/` - Context loading, reduction into beads, orchestration
//! - `tools/` - Structural extractor, git queries, `bd` wrapper
//! - `state/` - Per-project analysis metadata
//!
//! ## Usage
//!
//! ```rust,ignore
//! use beadloom_core::analysis::{AnalysisMode, CodebaseAnalyzer};
//!
//! let analyzer = CodebaseAnalyzer::new(project_dir, output_dir, backend, config, client);
//! let result = analyzer.run(false, AnalysisMode::Structure).await?;
//! ```

pub mod analysis;
pub mod config;
pub mod engine;
pub mod llm;
pub mod models;
pub mod state;
pub mod structure;
pub mod tools;
