//! # Pipeline Runner
//!
//! Scatter-gather over flow groups: split oversized groups, fan one model
//! call per group out to a bounded worker pool, then validate every reply in
//! dispatch order, retrying a failed validation exactly once.
//!
//! ## Failure model
//!
//! - A transport error fails its own group only.
//! - A reply that fails validation twice is a permanent group error.
//! - A tripped guardrail ends the run: pending calls are aborted and the
//!   result comes back with `budget_exceeded` status.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::cost::{CostSummary, CostTracker, GuardrailStatus};
use super::events::{PipelineEvent, PipelineEventKind};
use super::partition::FlowGroup;
use super::schema::{validate, ValidatedAnalysis};
use super::split::split_oversized;
use super::SourceMap;
use crate::analysis::prompts::{flow_group_prompt, retry_prompt, AnalysisMode, FLOW_ANALYSIS};
use crate::config::EngineConfig;
use crate::llm::{CompletionRequest, LlmClient};
use crate::models::{ModelConfig, ModelTier, PriceTable};

/// Outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    CompletedWithErrors,
    BudgetExceeded,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Completed => "completed",
            PipelineStatus::CompletedWithErrors => "completed_with_errors",
            PipelineStatus::BudgetExceeded => "budget_exceeded",
        }
    }
}

/// A group that did not produce an analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupError {
    pub group: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    /// Validated analyses; callers must not rely on their order
    pub analyses: Vec<ValidatedAnalysis>,
    pub validation_errors: Vec<GroupError>,
    pub cost_summary: CostSummary,
    /// Dispatch-level groups, after splitting
    pub groups_total: usize,
    /// Groups whose fan-out call returned a reply, valid or not
    pub groups_responded: usize,
    /// Groups with an analysis in `analyses`
    pub groups_succeeded: usize,
}

/// What a worker hands back for its group
enum CallOutcome {
    Reply(String),
    ApiError(String),
    /// Guardrail was already exceeded when the worker got its permit
    Skipped,
}

/// Runs flow-group analyses against a model
pub struct PipelineRunner {
    config: Arc<EngineConfig>,
    client: Arc<dyn LlmClient>,
    tracker: Arc<CostTracker>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineRunner {
    /// Create a runner with a fresh cost tracker for this run
    pub fn new(config: Arc<EngineConfig>, client: Arc<dyn LlmClient>, prices: PriceTable) -> Self {
        let tracker = Arc::new(CostTracker::new(prices, config.guardrails.clone()));
        Self {
            config,
            client,
            tracker,
            event_tx: None,
        }
    }

    /// Share an existing tracker (e.g. one already charged by earlier work)
    pub fn with_cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Set event channel for streaming progress
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.tracker
    }

    /// Drops the event when the channel is full or closed
    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Analyze `groups` and collect validated results.
    #[tracing::instrument(skip_all, fields(groups = groups.len(), mode = %mode))]
    pub async fn run(
        &self,
        groups: &[FlowGroup],
        sources: &SourceMap,
        mode: AnalysisMode,
        max_concurrency: usize,
    ) -> PipelineResult {
        if groups.is_empty() {
            return self.finish(PipelineStatus::Completed, Vec::new(), Vec::new(), 0, 0);
        }

        let dispatch = split_oversized(
            groups,
            |name| sources.get(name).map(|s| s.chars().count()).unwrap_or(0),
            self.config.max_source_chars_per_group,
        );
        let total = dispatch.len();
        let workers = max_concurrency.max(1).min(total);
        let model = self.config.sub_model(ModelTier::High);

        tracing::info!(
            groups_before_split = groups.len(),
            groups_after_split = total,
            workers,
            model = %model.model,
            "Starting pipeline"
        );
        self.emit(PipelineEvent::new(PipelineEventKind::PipelineStarted).with_data(
            serde_json::json!({ "groups": total, "workers": workers, "mode": mode }),
        ));

        if self.tracker.check_guardrails() == GuardrailStatus::Exceeded {
            tracing::warn!("Cost guardrail already exceeded, nothing dispatched");
            self.emit(PipelineEvent::new(PipelineEventKind::BudgetExceeded));
            return self.finish(PipelineStatus::BudgetExceeded, Vec::new(), Vec::new(), total, 0);
        }

        let prompts: Vec<String> = dispatch
            .iter()
            .map(|group| flow_group_prompt(group, sources, mode))
            .collect();

        // SCATTER
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set = JoinSet::new();
        for (idx, group) in dispatch.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&self.client);
            let tracker = Arc::clone(&self.tracker);
            let request = CompletionRequest::prompt(&model, prompts[idx].as_str())
                .with_system(FLOW_ANALYSIS);
            let tx = self.event_tx.clone();
            let name = group.name.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, CallOutcome::Skipped);
                };
                if tracker.check_guardrails() == GuardrailStatus::Exceeded {
                    return (idx, CallOutcome::Skipped);
                }
                if let Some(tx) = &tx {
                    let _ = tx.try_send(PipelineEvent::for_group(
                        PipelineEventKind::GroupDispatched,
                        &name,
                    ));
                }
                (idx, call_model(client.as_ref(), &tracker, request).await)
            });
        }

        // GATHER, in completion order
        let mut replies: Vec<Option<CallOutcome>> = (0..total).map(|_| None).collect();
        let mut warned = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let CallOutcome::ApiError(message) = &outcome {
                        tracing::error!(group = %dispatch[idx].name, error = %message, "Model call failed");
                    }
                    replies[idx] = Some(outcome);
                }
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }

            match self.tracker.check_guardrails() {
                GuardrailStatus::Exceeded => {
                    join_set.abort_all();
                    tracing::warn!(
                        cost_usd = self.tracker.estimated_cost_usd(),
                        calls = self.tracker.call_count(),
                        "Cost guardrail exceeded, cancelling pending calls"
                    );
                    self.emit(PipelineEvent::new(PipelineEventKind::BudgetExceeded));
                    return self.collect_partial(&dispatch, replies).await;
                }
                GuardrailStatus::Warning if !warned => {
                    warned = true;
                    tracing::warn!(
                        cost_usd = self.tracker.estimated_cost_usd(),
                        "Cost guardrail warning threshold reached"
                    );
                    self.emit(PipelineEvent::new(PipelineEventKind::BudgetWarning));
                }
                _ => {}
            }
        }

        // VALIDATE, in dispatch order
        let responded = count_replies(&replies);
        let mut analyses = Vec::new();
        let mut errors = Vec::new();
        let mut budget_hit = false;

        for (idx, reply) in replies.into_iter().enumerate() {
            let group = &dispatch[idx];
            let outcome = match reply {
                Some(CallOutcome::Reply(text)) => {
                    self.validate_with_retry(group, &prompts[idx], &text, &model, &mut budget_hit)
                        .await
                }
                Some(CallOutcome::ApiError(message)) => Err(format!("API error: {}", message)),
                Some(CallOutcome::Skipped) => {
                    budget_hit = true;
                    Err("not dispatched: cost guardrail exceeded".to_string())
                }
                None => Err("worker task aborted".to_string()),
            };
            match outcome {
                Ok(analysis) => {
                    self.emit(PipelineEvent::for_group(
                        PipelineEventKind::GroupCompleted,
                        &group.name,
                    ));
                    analyses.push(analysis);
                }
                Err(message) => {
                    self.emit(
                        PipelineEvent::for_group(PipelineEventKind::GroupFailed, &group.name)
                            .with_data(serde_json::json!({ "error": message })),
                    );
                    errors.push(GroupError {
                        group: group.name.clone(),
                        message,
                    });
                }
            }
        }

        let status = if budget_hit {
            PipelineStatus::BudgetExceeded
        } else if errors.is_empty() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::CompletedWithErrors
        };
        self.finish(status, analyses, errors, total, responded)
    }

    /// Validate a reply; on failure ask once more with the error attached
    async fn validate_with_retry(
        &self,
        group: &FlowGroup,
        prompt: &str,
        text: &str,
        model: &ModelConfig,
        budget_hit: &mut bool,
    ) -> Result<ValidatedAnalysis, String> {
        let error = match validate(text) {
            Ok(analysis) => return Ok(analysis),
            Err(e) => e,
        };
        tracing::warn!(group = %group.name, error = %error, "Validation failed, retrying");

        if self.tracker.check_guardrails() == GuardrailStatus::Exceeded {
            *budget_hit = true;
            return Err(format!(
                "validation failed: {}; retry skipped: cost guardrail exceeded",
                error
            ));
        }

        self.emit(
            PipelineEvent::for_group(PipelineEventKind::GroupRetried, &group.name)
                .with_data(serde_json::json!({ "error": error.to_string() })),
        );

        let request = CompletionRequest::prompt(model, retry_prompt(prompt, &error.to_string()))
            .with_system(FLOW_ANALYSIS);
        match call_model(self.client.as_ref(), &self.tracker, request).await {
            CallOutcome::Reply(retry_text) => match validate(&retry_text) {
                Ok(analysis) => {
                    tracing::info!(group = %group.name, "Retry produced a valid analysis");
                    Ok(analysis)
                }
                Err(e) => {
                    tracing::error!(group = %group.name, error = %e, "Retry failed validation");
                    Err(format!("validation failed after retry: {}", e))
                }
            },
            CallOutcome::ApiError(message) => {
                tracing::error!(group = %group.name, error = %message, "Retry call failed");
                Err(format!("retry API error: {}", message))
            }
            CallOutcome::Skipped => Err("retry skipped".to_string()),
        }
    }

    /// Result for a run cut short by the guardrail. Replies already in hand
    /// are validated but never retried.
    async fn collect_partial(
        &self,
        dispatch: &[FlowGroup],
        replies: Vec<Option<CallOutcome>>,
    ) -> PipelineResult {
        let responded = count_replies(&replies);
        let mut analyses = Vec::new();
        let mut errors = Vec::new();
        for (idx, reply) in replies.into_iter().enumerate() {
            let group = dispatch[idx].name.clone();
            match reply {
                Some(CallOutcome::Reply(text)) => match validate(&text) {
                    Ok(analysis) => analyses.push(analysis),
                    Err(e) => errors.push(GroupError {
                        group,
                        message: format!(
                            "validation failed: {}; retry skipped: cost guardrail exceeded",
                            e
                        ),
                    }),
                },
                Some(CallOutcome::ApiError(message)) => errors.push(GroupError {
                    group,
                    message: format!("API error: {}", message),
                }),
                Some(CallOutcome::Skipped) | None => {}
            }
        }
        self.finish(
            PipelineStatus::BudgetExceeded,
            analyses,
            errors,
            dispatch.len(),
            responded,
        )
    }

    fn finish(
        &self,
        status: PipelineStatus,
        analyses: Vec<ValidatedAnalysis>,
        validation_errors: Vec<GroupError>,
        groups_total: usize,
        groups_responded: usize,
    ) -> PipelineResult {
        let cost_summary = self.tracker.summary();
        tracing::info!(
            status = status.as_str(),
            succeeded = analyses.len(),
            total = groups_total,
            cost_usd = cost_summary.estimated_cost_usd,
            "Pipeline finished"
        );
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(
                PipelineEvent::new(PipelineEventKind::PipelineCompleted).with_data(
                    serde_json::json!({
                        "status": status,
                        "succeeded": analyses.len(),
                        "total": groups_total,
                    }),
                ),
            );
        }
        PipelineResult {
            status,
            groups_succeeded: analyses.len(),
            analyses,
            validation_errors,
            cost_summary,
            groups_total,
            groups_responded,
        }
    }
}

/// One model call; the cost of every completed call is recorded
async fn call_model(
    client: &dyn LlmClient,
    tracker: &CostTracker,
    request: CompletionRequest,
) -> CallOutcome {
    let model = request.model.clone();
    match client.complete(request).await {
        Ok(completion) => {
            tracker.record(&model, completion.input_tokens, completion.output_tokens);
            tracing::debug!(
                model = %model,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                cost_usd = tracker.estimated_cost_usd(),
                "Model call completed"
            );
            CallOutcome::Reply(completion.text)
        }
        Err(e) => CallOutcome::ApiError(format!("{:#}", e)),
    }
}

fn count_replies(replies: &[Option<CallOutcome>]) -> usize {
    replies
        .iter()
        .filter(|r| matches!(r, Some(CallOutcome::Reply(_))))
        .count()
}
