//! Beadloom CLI
//!
//! Analyze a Clojure project into a bead knowledge graph, check whether the
//! last analysis is stale, or inspect the flow groups a run would dispatch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use beadloom_core::analysis::{AnalysisMode, AnalysisResult, AnalysisStatus, CodebaseAnalyzer};
use beadloom_core::config::EngineConfig;
use beadloom_core::engine::{PipelineEvent, PipelineEventKind};
use beadloom_core::llm::{AnthropicClient, Completion, CompletionRequest, LlmClient};
use beadloom_core::models::ModelRegistry;
use beadloom_core::state::default_output_dir;
use beadloom_core::tools::ClojureStaticBackend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Clone)]
#[command(author, version, about = "Beadloom - flow-group analysis of Clojure codebases")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Analyze a project into beads
    Analyze {
        /// Project root (read only)
        project_dir: PathBuf,
        /// structure or security
        #[arg(long, default_value = "structure")]
        mode: AnalysisMode,
        /// Run even if the last analysis is fresh
        #[arg(long)]
        force: bool,
        /// Where beads and metadata are written
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// JSON engine config file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Staleness, extraction and flow groups only; no model calls
        #[arg(long)]
        dry_run: bool,
    },
    /// Report whether the last analysis is stale
    Status {
        project_dir: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Print the flow groups a run would dispatch, as JSON
    Groups {
        project_dir: PathBuf,
        /// Source character budget per group
        #[arg(long)]
        budget: Option<usize>,
    },
}

/// Client for commands that never call a model
struct Offline;

#[async_trait]
impl LlmClient for Offline {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
        anyhow::bail!("model calls are disabled for this command")
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn analyzer(
    project_dir: PathBuf,
    output_dir: Option<PathBuf>,
    config: EngineConfig,
    client: Arc<dyn LlmClient>,
) -> CodebaseAnalyzer {
    CodebaseAnalyzer::new(
        project_dir,
        output_dir.unwrap_or_else(default_output_dir),
        Arc::new(ClojureStaticBackend::new()),
        Arc::new(config),
        client,
    )
}

/// Log pipeline progress as it streams in
fn spawn_progress_logger() -> mpsc::Sender<PipelineEvent> {
    let (tx, mut rx) = mpsc::channel::<PipelineEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let group = event.group.as_deref().unwrap_or("-");
            match event.kind {
                PipelineEventKind::GroupFailed => {
                    tracing::warn!(group, data = ?event.data, "group failed")
                }
                PipelineEventKind::BudgetWarning | PipelineEventKind::BudgetExceeded => {
                    tracing::warn!(kind = ?event.kind, "budget")
                }
                kind => tracing::debug!(group, ?kind, "progress"),
            }
        }
    });
    tx
}

/// Human-readable run summary. `graph_ok` is the post-run graph check, if one ran.
fn report(result: &AnalysisResult, graph_ok: Option<bool>) -> String {
    let mut lines = vec![
        format!("Status:      {}", result.status.as_str()),
        format!("Staleness:   {:?}", result.staleness.status),
    ];
    if let Some(sha) = &result.commit_sha {
        lines.push(format!("Commit:      {}", sha));
    }
    lines.push(format!("Namespaces:  {}", result.namespace_count));
    lines.push(format!("Flow groups: {}", result.flow_groups));

    if let Some(pipeline) = &result.pipeline {
        lines.push(format!(
            "Groups:      {}/{} succeeded",
            pipeline.groups_succeeded, pipeline.groups_total
        ));
        lines.push(format!(
            "Cost:        ${:.4} over {} calls ({} in / {} out tokens)",
            pipeline.cost_summary.estimated_cost_usd,
            pipeline.cost_summary.total_calls,
            pipeline.cost_summary.total_input_tokens,
            pipeline.cost_summary.total_output_tokens
        ));
        for error in &pipeline.validation_errors {
            lines.push(format!("  ! {}: {}", error.group, error.message));
        }
    }
    if let Some(reduced) = &result.reduce {
        lines.push(format!(
            "Beads:       {} created, {} links, {} tags",
            reduced.created_count, reduced.links_created, reduced.tags_applied
        ));
        for flow in &reduced.failed {
            lines.push(format!("  ! bead not created: {}", flow));
        }
    }
    match graph_ok {
        Some(true) => lines.push("Graph:       OK".to_string()),
        Some(false) => lines.push("Graph:       no structure beads found".to_string()),
        None => {}
    }
    lines.join("\n")
}

async fn run(args: Args) -> Result<ExitCode> {
    let registry = ModelRegistry::default();

    match args.command {
        CliCommand::Analyze {
            project_dir,
            mode,
            force,
            output_dir,
            config,
            max_concurrency,
            dry_run,
        } => {
            let mut engine_config = EngineConfig::load(config.as_deref(), &registry)
                .context("Failed to load engine config")?;
            if let Some(n) = max_concurrency {
                engine_config.max_concurrency = n;
            }

            if dry_run {
                let plan = analyzer(project_dir, output_dir, engine_config, Arc::new(Offline))
                    .plan(None)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(ExitCode::SUCCESS);
            }

            let client = AnthropicClient::from_env()?;
            let codebase = analyzer(project_dir, output_dir, engine_config, Arc::new(client))
                .with_event_channel(spawn_progress_logger());
            let result = codebase.run(force, mode).await?;
            let graph_ok = if result.status == AnalysisStatus::Completed {
                Some(codebase.verify_graph().await)
            } else {
                None
            };
            println!("{}", report(&result, graph_ok));

            Ok(if result.status.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        CliCommand::Status {
            project_dir,
            output_dir,
        } => {
            let engine_config = EngineConfig::load(None, &registry)?;
            let staleness = analyzer(project_dir, output_dir, engine_config, Arc::new(Offline))
                .check_staleness()
                .await;
            println!("{}", serde_json::to_string_pretty(&staleness)?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Groups {
            project_dir,
            budget,
        } => {
            let engine_config = EngineConfig::load(None, &registry)?;
            let plan = analyzer(project_dir, None, engine_config, Arc::new(Offline))
                .plan(budget)
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan.groups)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beadloom_core::analysis::{StalenessResult, StalenessStatus};

    #[test]
    fn test_parse_analyze() {
        let args = Args::try_parse_from([
            "beadloom",
            "analyze",
            "/tmp/svc",
            "--mode",
            "security",
            "--force",
            "--max-concurrency",
            "4",
        ])
        .unwrap();
        match args.command {
            CliCommand::Analyze {
                mode,
                force,
                max_concurrency,
                dry_run,
                ..
            } => {
                assert_eq!(mode, AnalysisMode::Security);
                assert!(force);
                assert_eq!(max_concurrency, Some(4));
                assert!(!dry_run);
            }
            _ => panic!("expected analyze"),
        }
    }

    fn completed() -> AnalysisResult {
        AnalysisResult {
            status: AnalysisStatus::Completed,
            staleness: StalenessResult {
                status: StalenessStatus::NoPriorAnalysis,
                last_sha: None,
                current_sha: Some("abc123".to_string()),
                changed_files: Vec::new(),
                changed_namespaces: Vec::new(),
            },
            namespace_count: 3,
            flow_groups: 2,
            commit_sha: Some("abc123".to_string()),
            pipeline: None,
            reduce: None,
        }
    }

    #[test]
    fn test_report_includes_graph_check() {
        let result = completed();
        assert!(report(&result, Some(true)).ends_with("Graph:       OK"));
        assert!(report(&result, Some(false)).contains("no structure beads"));
        let without = report(&result, None);
        assert!(without.contains("Status:      completed"));
        assert!(!without.contains("Graph:"));
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(Args::try_parse_from(["beadloom", "analyze", ".", "--mode", "deep"]).is_err());
    }

    #[test]
    fn test_groups_budget() {
        let args = Args::try_parse_from(["beadloom", "-v", "groups", ".", "--budget", "1000"]).unwrap();
        assert!(args.verbose);
        assert!(matches!(args.command, CliCommand::Groups { budget: Some(1000), .. }));
    }
}
