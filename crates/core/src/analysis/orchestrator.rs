//! # Orchestrator
//!
//! Runs a whole analysis of one project:
//!
//! ```text
//! staleness check → structure + sources → partition → pipeline → reduce → metadata
//! ```
//!
//! The analyzed project is only ever read. The bead database and the
//! analysis metadata live under the output directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::context::CodebaseContext;
use super::prompts::AnalysisMode;
use super::reducer::{reduce, ReduceResult};
use crate::config::EngineConfig;
use crate::engine::events::PipelineEvent;
use crate::engine::partition::{partition_flow_groups, FlowGroup};
use crate::engine::pipeline::{PipelineResult, PipelineRunner, PipelineStatus};
use crate::engine::split::split_oversized;
use crate::llm::LlmClient;
use crate::models::PriceTable;
use crate::state::metadata::{load_metadata, metadata_path, save_metadata, AnalysisMetadata};
use crate::tools::beads::{BeadStore, BeadsCli};
use crate::tools::git::GitRepo;
use crate::tools::scanner::LanguageBackend;

/// File extensions whose changes can affect the namespace graph
const SOURCE_EXTENSIONS: [&str; 3] = ["clj", "cljc", "cljs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessStatus {
    Fresh,
    Stale,
    NoPriorAnalysis,
    NoBeads,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessResult {
    pub status: StalenessStatus,
    /// Commit of the last completed analysis
    pub last_sha: Option<String>,
    /// Current HEAD, if the project is a git repository
    pub current_sha: Option<String>,
    pub changed_files: Vec<String>,
    pub changed_namespaces: Vec<String>,
}

impl StalenessResult {
    fn new(status: StalenessStatus, current_sha: Option<String>) -> Self {
        Self {
            status,
            last_sha: None,
            current_sha,
            changed_files: Vec::new(),
            changed_namespaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    CompletedWithErrors,
    BudgetExceeded,
    SkippedFresh,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::CompletedWithErrors => "completed_with_errors",
            AnalysisStatus::BudgetExceeded => "budget_exceeded",
            AnalysisStatus::SkippedFresh => "skipped_fresh",
        }
    }

    /// Nothing left to do for this commit
    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::SkippedFresh)
    }
}

impl From<PipelineStatus> for AnalysisStatus {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Completed => AnalysisStatus::Completed,
            PipelineStatus::CompletedWithErrors => AnalysisStatus::CompletedWithErrors,
            PipelineStatus::BudgetExceeded => AnalysisStatus::BudgetExceeded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    pub staleness: StalenessResult,
    pub namespace_count: usize,
    /// Flow groups before splitting
    pub flow_groups: usize,
    /// HEAD the run analyzed
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub pipeline: Option<PipelineResult>,
    #[serde(default)]
    pub reduce: Option<ReduceResult>,
}

/// What a run would dispatch, without calling a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub staleness: StalenessResult,
    pub namespace_count: usize,
    pub total_source_chars: usize,
    /// Groups after splitting, in dispatch order
    pub groups: Vec<FlowGroup>,
}

/// Analyzes one project end to end
pub struct CodebaseAnalyzer {
    project_dir: PathBuf,
    output_dir: PathBuf,
    backend: Arc<dyn LanguageBackend>,
    config: Arc<EngineConfig>,
    client: Arc<dyn LlmClient>,
    prices: PriceTable,
    store: Arc<dyn BeadStore>,
    git: GitRepo,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl CodebaseAnalyzer {
    /// Beads go to `<output_dir>/beads.db` through the `bd` tool
    pub fn new(
        project_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        backend: Arc<dyn LanguageBackend>,
        config: Arc<EngineConfig>,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        let project_dir = project_dir.into();
        let project_dir = std::fs::canonicalize(&project_dir).unwrap_or(project_dir);
        let output_dir = output_dir.into();
        let store = Arc::new(BeadsCli::new(Some(output_dir.join("beads.db"))));
        Self {
            git: GitRepo::new(project_dir.clone()),
            project_dir,
            output_dir,
            backend,
            config,
            client,
            prices: PriceTable::default(),
            store,
            event_tx: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BeadStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// Set event channel for streaming pipeline progress
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn project_name(&self) -> String {
        self.project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn metadata_path(&self) -> PathBuf {
        metadata_path(&self.output_dir, &self.project_name())
    }

    /// Compare the last analyzed commit against HEAD
    pub async fn check_staleness(&self) -> StalenessResult {
        let current_sha = self.git.current_sha().await.ok();

        if !self.output_dir.exists() {
            return StalenessResult::new(StalenessStatus::NoBeads, current_sha);
        }

        let last_sha = match load_metadata(&self.metadata_path()).await {
            Ok(Some(meta)) if !meta.commit_sha.is_empty() => meta.commit_sha,
            Ok(_) => return StalenessResult::new(StalenessStatus::NoPriorAnalysis, current_sha),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read analysis metadata");
                return StalenessResult::new(StalenessStatus::NoPriorAnalysis, current_sha);
            }
        };

        if current_sha.as_deref() == Some(last_sha.as_str()) {
            return StalenessResult {
                last_sha: Some(last_sha),
                ..StalenessResult::new(StalenessStatus::Fresh, current_sha)
            };
        }

        let to = current_sha.as_deref().unwrap_or("HEAD");
        let changed_files: Vec<String> = match self.git.changed_files(&last_sha, to).await {
            Ok(files) => files.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list changed files");
                Vec::new()
            }
        };
        let changed_namespaces = self.map_files_to_namespaces(&changed_files).await;

        let status = if changed_namespaces.is_empty() {
            StalenessStatus::Fresh
        } else {
            StalenessStatus::Stale
        };
        StalenessResult {
            status,
            last_sha: Some(last_sha),
            current_sha,
            changed_files,
            changed_namespaces,
        }
    }

    async fn map_files_to_namespaces(&self, changed_files: &[String]) -> Vec<String> {
        let source_changes: Vec<&String> = changed_files
            .iter()
            .filter(|f| {
                Path::new(f.as_str())
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
            })
            .collect();
        if source_changes.is_empty() {
            return Vec::new();
        }

        let context = match self.load_context().await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "Could not extract structure for staleness");
                return Vec::new();
            }
        };
        context
            .structure
            .namespaces
            .iter()
            .filter(|ns| {
                let rel = context.relative_path(&ns.path);
                source_changes.iter().any(|f| Path::new(f.as_str()) == rel)
            })
            .map(|ns| ns.name.clone())
            .collect()
    }

    async fn load_context(&self) -> Result<CodebaseContext> {
        let backend = Arc::clone(&self.backend);
        let root = self.project_dir.clone();
        let context = tokio::task::spawn_blocking(move || CodebaseContext::load(&root, backend.as_ref()))
            .await
            .context("Structure extraction task failed")?
            .with_context(|| format!("Failed to load codebase context from {:?}", self.project_dir))?;
        Ok(context)
    }

    /// Full analysis; a fresh analysis is skipped unless `force`
    #[tracing::instrument(skip(self), fields(project = %self.project_name()))]
    pub async fn run(&self, force: bool, mode: AnalysisMode) -> Result<AnalysisResult> {
        let staleness = self.check_staleness().await;
        tracing::info!(status = ?staleness.status, "Staleness checked");

        if !force && staleness.status == StalenessStatus::Fresh {
            tracing::info!("Analysis is fresh, skipping (use --force to override)");
            return Ok(AnalysisResult {
                status: AnalysisStatus::SkippedFresh,
                commit_sha: staleness.current_sha.clone(),
                staleness,
                namespace_count: 0,
                flow_groups: 0,
                pipeline: None,
                reduce: None,
            });
        }

        let context = self.load_context().await?;
        self.analyze(context, mode, staleness).await
    }

    /// Analyze only `changed_namespaces`, and only edges among them
    #[tracing::instrument(skip(self, changed_namespaces), fields(changed = changed_namespaces.len()))]
    pub async fn run_incremental(
        &self,
        changed_namespaces: &[String],
        mode: AnalysisMode,
    ) -> Result<AnalysisResult> {
        let staleness = self.check_staleness().await;
        let context = self.load_context().await?.restrict_to(changed_namespaces);
        self.analyze(context, mode, staleness).await
    }

    async fn analyze(
        &self,
        context: CodebaseContext,
        mode: AnalysisMode,
        staleness: StalenessResult,
    ) -> Result<AnalysisResult> {
        let sources = context.load_sources().await;
        let groups = partition_flow_groups(&context.structure);
        tracing::info!(
            namespaces = context.structure.namespaces.len(),
            flow_groups = groups.len(),
            "Context loaded"
        );

        let mut runner =
            PipelineRunner::new(Arc::clone(&self.config), Arc::clone(&self.client), self.prices.clone());
        if let Some(tx) = &self.event_tx {
            runner = runner.with_event_channel(tx.clone());
        }
        let pipeline = runner
            .run(&groups, &sources, mode, self.config.max_concurrency)
            .await;

        let reduced = reduce(&pipeline.analyses, self.store.as_ref()).await;

        let status = AnalysisStatus::from(pipeline.status);
        let commit_sha = staleness.current_sha.clone();
        if status == AnalysisStatus::Completed {
            if let Some(sha) = &commit_sha {
                self.store_analysis_metadata(sha).await?;
            }
        }

        Ok(AnalysisResult {
            status,
            staleness,
            namespace_count: context.structure.namespaces.len(),
            flow_groups: groups.len(),
            commit_sha,
            pipeline: Some(pipeline),
            reduce: Some(reduced),
        })
    }

    /// Staleness, extraction and the dispatch-level groups, with no model calls.
    /// `budget` overrides the configured per-group source budget.
    pub async fn plan(&self, budget: Option<usize>) -> Result<AnalysisPlan> {
        let staleness = self.check_staleness().await;
        let context = self.load_context().await?;
        let sources = context.load_sources().await;
        let groups = split_oversized(
            &partition_flow_groups(&context.structure),
            |name| sources.get(name).map(|s| s.chars().count()).unwrap_or(0),
            budget.unwrap_or(self.config.max_source_chars_per_group),
        );
        Ok(AnalysisPlan {
            staleness,
            namespace_count: context.structure.namespaces.len(),
            total_source_chars: context.structure.total_source_chars,
            groups,
        })
    }

    /// Whether the graph holds any structure beads
    pub async fn verify_graph(&self) -> bool {
        match self.store.query("tag:structure").await {
            Ok(out) => !out.trim().is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "Graph verification failed");
                false
            }
        }
    }

    pub async fn store_analysis_metadata(&self, commit_sha: &str) -> Result<()> {
        let path = self.metadata_path();
        save_metadata(&path, &AnalysisMetadata::new(commit_sha, self.backend.name())).await?;
        tracing::info!(sha = %commit_sha, path = ?path, "Stored analysis metadata");
        Ok(())
    }
}
