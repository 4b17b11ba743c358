//! # Agent Loop
//!
//! The root model works a task by replying with one JSON action per turn:
//!
//! ```text
//! {"tool": "<name>", "args": {...}}   run a registered tool, observe its result
//! {"final": <value>}                  finish with a result
//! ```
//!
//! Nothing the model writes is executed; it can only name tools from the
//! [`ToolRegistry`]. Small tasks with no tools skip the loop and go to the
//! model in a single call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;
use std::sync::Arc;

use super::cost::{CostSummary, CostTracker, GuardrailStatus};
use super::gate::{estimate_source_tokens, estimate_tokens, route_task, GateDecision};
use super::schema::extract_json;
use super::tools::ToolRegistry;
use super::SourceMap;
use crate::analysis::prompts::AGENT_SYSTEM;
use crate::config::EngineConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::models::PriceTable;

/// Outcome of one step
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Feed this observation back to the model
    Continue(String),
    /// The model finished with this value
    Done(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    BudgetExceeded,
    MaxIterations,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    /// Model turns taken
    pub iterations: u32,
    pub gate: GateDecision,
    pub cost_summary: CostSummary,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Drives the root model through a task
pub struct AgentEngine {
    config: Arc<EngineConfig>,
    client: Arc<dyn LlmClient>,
    tracker: Arc<CostTracker>,
    tools: ToolRegistry,
}

impl AgentEngine {
    pub fn new(config: Arc<EngineConfig>, client: Arc<dyn LlmClient>, prices: PriceTable) -> Self {
        let tracker = Arc::new(CostTracker::new(prices, config.guardrails.clone()));
        Self {
            config,
            client,
            tracker,
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.tracker
    }

    /// Work `task` over `sources`. `force_fan_out` overrides the token gate.
    #[tracing::instrument(skip_all, fields(tools = self.tools.len()))]
    pub async fn run(&self, task: &str, sources: &SourceMap, force_fan_out: Option<bool>) -> AgentResult {
        let tokens = estimate_tokens(task) + estimate_source_tokens(sources);
        let gate = route_task(tokens, force_fan_out, self.config.threshold_tokens);
        tracing::info!(tokens, fan_out = gate.fan_out, reason = %gate.reason, "Gate decision");

        if !gate.fan_out && self.tools.is_empty() {
            return self.run_direct(task, sources, gate).await;
        }
        self.run_loop(task, sources, gate).await
    }

    /// One call with everything inline
    async fn run_direct(&self, task: &str, sources: &SourceMap, gate: GateDecision) -> AgentResult {
        if self.tracker.check_guardrails() == GuardrailStatus::Exceeded {
            return self.result(AgentStatus::BudgetExceeded, 0, gate, None, None);
        }

        let mut prompt = format!("{}\n\n## Source\n", task);
        for (name, source) in sources {
            let _ = writeln!(prompt, "\n### {}\n```clojure\n{}\n```", name, source.trim_end());
        }

        let model = self.config.root();
        match self.client.complete(CompletionRequest::prompt(&model, prompt)).await {
            Ok(completion) => {
                self.tracker
                    .record(&model.model, completion.input_tokens, completion.output_tokens);
                self.result(
                    AgentStatus::Completed,
                    1,
                    gate,
                    Some(Value::String(completion.text)),
                    None,
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "Direct call failed");
                self.result(AgentStatus::Error, 1, gate, None, Some(format!("{:#}", e)))
            }
        }
    }

    async fn run_loop(&self, task: &str, sources: &SourceMap, gate: GateDecision) -> AgentResult {
        let model = self.config.root();
        let system = format!(
            "{}\n\n## Tools\n\n{}",
            AGENT_SYSTEM.trim_end(),
            serde_json::to_string_pretty(&self.tools.describe()).unwrap_or_default()
        );

        let mut opening = format!("{}\n\n## Namespaces\n", task);
        for (name, source) in sources {
            let _ = writeln!(opening, "- {} ({} chars)", name, source.len());
        }
        let mut messages = vec![ChatMessage::user(opening)];

        let max_iterations = self.config.root_max_iterations;
        for iteration in 1..=max_iterations {
            if self.tracker.check_guardrails() == GuardrailStatus::Exceeded {
                tracing::warn!(iteration, "Cost guardrail exceeded, stopping agent loop");
                return self.result(AgentStatus::BudgetExceeded, iteration - 1, gate, None, None);
            }

            let request =
                CompletionRequest::conversation(&model, messages.clone()).with_system(system.as_str());
            let completion = match self.client.complete(request).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(iteration, error = %e, "Root model call failed");
                    return self.result(
                        AgentStatus::Error,
                        iteration,
                        gate,
                        None,
                        Some(format!("{:#}", e)),
                    );
                }
            };
            self.tracker
                .record(&model.model, completion.input_tokens, completion.output_tokens);

            let step = self.step(&completion.text).await;
            messages.push(ChatMessage::assistant(completion.text));
            match step {
                Step::Done(value) => {
                    tracing::info!(iteration, "Agent finished");
                    return self.result(AgentStatus::Completed, iteration, gate, Some(value), None);
                }
                Step::Continue(observation) => messages.push(ChatMessage::user(observation)),
            }
        }

        tracing::warn!(max_iterations, "Agent hit its iteration limit");
        self.result(AgentStatus::MaxIterations, max_iterations, gate, None, None)
    }

    /// Interpret one model reply
    pub async fn step(&self, reply: &str) -> Step {
        let action: Value = match serde_json::from_str(extract_json(reply)) {
            Ok(v) => v,
            Err(e) => {
                return Step::Continue(format!(
                    "Error: reply is not a JSON action ({}). Reply with {{\"tool\": ..., \"args\": ...}} or {{\"final\": ...}}.",
                    e
                ))
            }
        };

        if let Some(value) = action.get("final") {
            return Step::Done(value.clone());
        }

        let Some(tool) = action.get("tool").and_then(Value::as_str) else {
            return Step::Continue(
                "Error: action must have a \"tool\" or a \"final\" key.".to_string(),
            );
        };
        let args = action.get("args").cloned().unwrap_or(Value::Null);
        let result = self.tools.invoke(tool, args).await;
        if !result.success {
            tracing::debug!(tool = %tool, error = ?result.error, "Tool call failed");
        }
        Step::Continue(format!(
            "Tool {} returned: {}",
            tool,
            serde_json::to_string(&result).unwrap_or_default()
        ))
    }

    fn result(
        &self,
        status: AgentStatus,
        iterations: u32,
        gate: GateDecision,
        output: Option<Value>,
        error: Option<String>,
    ) -> AgentResult {
        AgentResult {
            status,
            iterations,
            gate,
            cost_summary: self.tracker.summary(),
            output,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailsConfig;
    use crate::llm::Completion;
    use crate::tools::beads::testing::MemoryBeads;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a fixed script, one per call
    struct ScriptedRoot {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedRoot {
        fn new(replies: Vec<anyhow::Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedRoot {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion> {
            let model = request.model.clone();
            self.requests.lock().unwrap().push(request);
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{\"tool\": \"noop\"}".to_string()))?;
            Ok(Completion {
                text,
                input_tokens: 1000,
                output_tokens: 100,
                model,
            })
        }
    }

    fn engine(client: Arc<ScriptedRoot>, config: EngineConfig) -> AgentEngine {
        AgentEngine::new(Arc::new(config), client, PriceTable::new())
    }

    #[tokio::test]
    async fn test_small_task_goes_direct() {
        let client = Arc::new(ScriptedRoot::new(vec![Ok("summary".to_string())]));
        let mut sources = SourceMap::new();
        sources.insert("a.core".to_string(), "(ns a.core)".to_string());

        let result = engine(client.clone(), EngineConfig::default())
            .run("Summarise", &sources, None)
            .await;

        assert_eq!(result.status, AgentStatus::Completed);
        assert!(!result.gate.fan_out);
        assert_eq!(result.output, Some(Value::String("summary".to_string())));
        assert_eq!(client.calls(), 1);
        assert!(client.requests.lock().unwrap()[0].last_prompt().contains("(ns a.core)"));
    }

    #[tokio::test]
    async fn test_tool_then_final() {
        let store = Arc::new(MemoryBeads::default());
        let client = Arc::new(ScriptedRoot::new(vec![
            Ok(r#"{"tool": "create_bead", "args": {"title": "flow-a", "body": "{}", "tags": ["structure"]}}"#.to_string()),
            Ok("```json\n{\"final\": {\"beads\": 1}}\n```".to_string()),
        ]));
        let agent = engine(client.clone(), EngineConfig::default())
            .with_tools(ToolRegistry::new().with_bead_tools(store.clone()));

        let result = agent.run("Record flows", &SourceMap::new(), None).await;

        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.output.unwrap()["beads"], 1);
        assert!(store.record("flow-a").is_some());
        // the tool observation went back as the next user turn
        let second = &client.requests.lock().unwrap()[1];
        assert!(second.last_prompt().starts_with("Tool create_bead returned"));
        assert!(second.system.as_deref().unwrap().contains("create_bead"));
    }

    #[tokio::test]
    async fn test_garbage_reply_continues() {
        let agent = engine(Arc::new(ScriptedRoot::new(vec![])), EngineConfig::default());
        match agent.step("I think we should look at the adapters").await {
            Step::Continue(obs) => assert!(obs.starts_with("Error: reply is not a JSON action")),
            Step::Done(_) => panic!("prose must not finish the loop"),
        }
        match agent.step("{\"args\": {}}").await {
            Step::Continue(obs) => assert!(obs.contains("\"tool\" or a \"final\"")),
            Step::Done(_) => panic!("missing action key"),
        }
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let config = EngineConfig {
            root_max_iterations: 3,
            ..EngineConfig::default()
        };
        let client = Arc::new(ScriptedRoot::new(vec![]));
        let result = engine(client.clone(), config)
            .run("Loop forever", &SourceMap::new(), Some(true))
            .await;
        assert_eq!(result.status, AgentStatus::MaxIterations);
        assert_eq!(result.iterations, 3);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_budget_stops_loop() {
        // one opus call at 1000/100 tokens is $0.0225
        let config = EngineConfig {
            guardrails: GuardrailsConfig {
                max_cost_per_run_usd: 0.04,
                warn_cost_threshold_usd: 0.01,
                ..GuardrailsConfig::default()
            },
            ..EngineConfig::default()
        };
        let client = Arc::new(ScriptedRoot::new(vec![]));
        let result = engine(client.clone(), config)
            .run("Spend", &SourceMap::new(), Some(true))
            .await;
        assert_eq!(result.status, AgentStatus::BudgetExceeded);
        assert_eq!(result.iterations, 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_model_error() {
        let client = Arc::new(ScriptedRoot::new(vec![Err(anyhow!("connection reset"))]));
        let result = engine(client, EngineConfig::default())
            .run("Anything", &SourceMap::new(), Some(true))
            .await;
        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.error.unwrap().contains("connection reset"));
    }
}
