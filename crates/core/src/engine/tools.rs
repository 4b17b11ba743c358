//! # Tool Registry
//!
//! Explicit capability list for the agent loop. The root model can only
//! invoke tools registered here, by name, with JSON arguments that are
//! deserialized into a typed argument struct before the handler runs.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::cost::{CostTracker, GuardrailStatus};
use crate::config::EngineConfig;
use crate::llm::{CompletionRequest, LlmClient};
use crate::models::ModelTier;
use crate::tools::beads::{BeadStore, Relation};

/// What a tool hands back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> ToolResult;
}

/// A registered tool
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    /// Tool from an async function over a typed argument struct
    pub fn typed<A, F, Fut>(name: &str, description: &str, f: F) -> Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::to_value(schemars::schema_for!(A)).unwrap_or(Value::Null),
            handler: Arc::new(FnTool {
                f,
                _args: PhantomData,
            }),
        }
    }
}

struct FnTool<A, F> {
    f: F,
    _args: PhantomData<fn() -> A>,
}

#[async_trait]
impl<A, F, Fut> ToolHandler for FnTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    async fn call(&self, args: Value) -> ToolResult {
        match serde_json::from_value::<A>(args) {
            Ok(args) => (self.f)(args).await,
            Err(e) => ToolResult::error(format!("invalid arguments: {}", e)),
        }
    }
}

/// Name -> tool
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tool
    pub fn register(&mut self, tool: ToolSpec) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Tool listing for the system prompt
    pub fn describe(&self) -> Value {
        Value::Array(
            self.tools
                .values()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect(),
        )
    }

    /// Run a tool by name. Unknown names are refused, never guessed.
    pub async fn invoke(&self, name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(format!(
                "unknown tool '{}'; available: {}",
                name,
                self.names().join(", ")
            ));
        };
        let args = if args.is_null() { json!({}) } else { args };
        tracing::debug!(tool = %name, "Invoking tool");
        tool.handler.call(args).await
    }

    /// Register `llm_query`, a sub-model call charged to `tracker`
    pub fn with_llm_query(
        mut self,
        client: Arc<dyn LlmClient>,
        config: Arc<EngineConfig>,
        tracker: Arc<CostTracker>,
    ) -> Self {
        self.register(ToolSpec::typed(
            "llm_query",
            "Ask a sub-model a question. tier is 'high' (default) or 'low'.",
            move |args: LlmQueryArgs| {
                let client = Arc::clone(&client);
                let config = Arc::clone(&config);
                let tracker = Arc::clone(&tracker);
                async move {
                    if tracker.check_guardrails() == GuardrailStatus::Exceeded {
                        return ToolResult::error("cost guardrail exceeded");
                    }
                    let tier = match args.tier.as_deref() {
                        None => ModelTier::High,
                        Some(t) => match ModelTier::parse(t) {
                            Some(tier) => tier,
                            None => return ToolResult::error(format!("unknown tier '{}'", t)),
                        },
                    };
                    let model = config.sub_model(tier);
                    match client
                        .complete(CompletionRequest::prompt(&model, args.prompt))
                        .await
                    {
                        Ok(completion) => {
                            tracker.record(
                                &model.model,
                                completion.input_tokens,
                                completion.output_tokens,
                            );
                            ToolResult::success(json!({ "text": completion.text }))
                        }
                        Err(e) => ToolResult::error(format!("{:#}", e)),
                    }
                }
            },
        ));
        self
    }

    /// Register the bead graph tools backed by `store`
    pub fn with_bead_tools(mut self, store: Arc<dyn BeadStore>) -> Self {
        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "create_bead",
            "Create a bead. Returns its id.",
            move |args: CreateBeadArgs| {
                let store = Arc::clone(&s);
                async move {
                    match store.create(&args.title, &args.body, &args.tags).await {
                        Ok(id) => ToolResult::success(json!({ "id": id })),
                        Err(e) => ToolResult::error(e.to_string()),
                    }
                }
            },
        ));

        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "link_beads",
            "Link two beads. relation: depends-on (default), relates-to or blocks.",
            move |args: LinkBeadsArgs| {
                let store = Arc::clone(&s);
                async move {
                    let relation = match args.relation.as_deref().unwrap_or("depends-on").parse::<Relation>() {
                        Ok(relation) => relation,
                        Err(e) => return ToolResult::error(e.to_string()),
                    };
                    flag(store.link(&args.from, &args.to, relation).await)
                }
            },
        ));

        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "tag_bead",
            "Add tags to a bead.",
            move |args: TagBeadArgs| {
                let store = Arc::clone(&s);
                async move { flag(store.tag(&args.id, &args.tags).await) }
            },
        ));

        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "comment_bead",
            "Add a comment to a bead.",
            move |args: CommentBeadArgs| {
                let store = Arc::clone(&s);
                async move { flag(store.comment(&args.id, &args.text).await) }
            },
        ));

        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "close_bead",
            "Close a bead with a reason.",
            move |args: CloseBeadArgs| {
                let store = Arc::clone(&s);
                async move { flag(store.close(&args.id, &args.reason).await) }
            },
        ));

        let s = Arc::clone(&store);
        self.register(ToolSpec::typed(
            "query_beads",
            "Query beads with a filter expression such as tag:structure.",
            move |args: QueryBeadsArgs| {
                let store = Arc::clone(&s);
                async move {
                    match store.query(&args.filter).await {
                        Ok(text) => ToolResult::success(json!({ "result": text })),
                        Err(e) => ToolResult::error(e.to_string()),
                    }
                }
            },
        ));

        self.register(ToolSpec::typed(
            "export_graph",
            "Export the whole bead graph.",
            move |_: NoArgs| {
                let store = Arc::clone(&store);
                async move {
                    match store.export().await {
                        Ok(text) => ToolResult::success(json!({ "export": text })),
                        Err(e) => ToolResult::error(e.to_string()),
                    }
                }
            },
        ));
        self
    }
}

fn flag<E: std::fmt::Display>(result: Result<bool, E>) -> ToolResult {
    match result {
        Ok(ok) => ToolResult {
            success: ok,
            data: json!({ "ok": ok }),
            error: (!ok).then(|| "bd refused the operation".to_string()),
        },
        Err(e) => ToolResult::error(e.to_string()),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LlmQueryArgs {
    /// Question for the sub-model
    pub prompt: String,
    /// high or low
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateBeadArgs {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LinkBeadsArgs {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub relation: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TagBeadArgs {
    pub id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CommentBeadArgs {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CloseBeadArgs {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct QueryBeadsArgs {
    /// Filter expression, e.g. tag:structure
    pub filter: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailsConfig;
    use crate::llm::Completion;
    use crate::models::PriceTable;
    use crate::tools::beads::testing::MemoryBeads;

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<Completion> {
            Ok(Completion {
                text: format!("echo: {}", request.last_prompt()),
                input_tokens: 100,
                output_tokens: 10,
                model: request.model,
            })
        }
    }

    fn tracker() -> Arc<CostTracker> {
        Arc::new(CostTracker::new(PriceTable::new(), GuardrailsConfig::default()))
    }

    #[tokio::test]
    async fn test_unknown_tool_is_refused() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("exec", json!({"code": "(System/exit 0)"})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown tool 'exec'"));
    }

    #[tokio::test]
    async fn test_llm_query_records_cost() {
        let tracker = tracker();
        let registry = ToolRegistry::new().with_llm_query(
            Arc::new(EchoClient),
            Arc::new(EngineConfig::default()),
            Arc::clone(&tracker),
        );
        let result = registry
            .invoke("llm_query", json!({"prompt": "what calls kafka?", "tier": "low"}))
            .await;
        assert!(result.success);
        assert_eq!(result.data["text"], "echo: what calls kafka?");
        assert_eq!(tracker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_query_bad_tier() {
        let registry = ToolRegistry::new().with_llm_query(
            Arc::new(EchoClient),
            Arc::new(EngineConfig::default()),
            tracker(),
        );
        let result = registry
            .invoke("llm_query", json!({"prompt": "x", "tier": "medium"}))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let registry = ToolRegistry::new().with_bead_tools(Arc::new(MemoryBeads::default()));
        let result = registry.invoke("create_bead", json!({"title": 3})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("invalid arguments"));
    }

    #[tokio::test]
    async fn test_bead_tools_round_trip() {
        let store = Arc::new(MemoryBeads::default());
        let registry = ToolRegistry::new().with_bead_tools(store.clone());
        assert_eq!(registry.len(), 7);

        let a = registry
            .invoke("create_bead", json!({"title": "flow-a", "body": "{}", "tags": ["structure"]}))
            .await;
        let b = registry
            .invoke("create_bead", json!({"title": "flow-b", "body": "{}"}))
            .await;
        let a_id = a.data["id"].as_str().unwrap().to_string();
        let b_id = b.data["id"].as_str().unwrap().to_string();

        let linked = registry
            .invoke("link_beads", json!({"from": a_id, "to": b_id}))
            .await;
        assert!(linked.success);
        assert_eq!(store.links(), vec![(a_id.clone(), b_id, Relation::DependsOn)]);

        let query = registry
            .invoke("query_beads", json!({"filter": "tag:structure"}))
            .await;
        assert!(query.data["result"].as_str().unwrap().contains("flow-a"));

        let export = registry.invoke("export_graph", Value::Null).await;
        assert!(export.success);
    }

    #[tokio::test]
    async fn test_injection_rejected_by_store() {
        let registry = ToolRegistry::new().with_bead_tools(Arc::new(MemoryBeads::default()));
        let result = registry
            .invoke("tag_bead", json!({"id": "bd-1; rm -rf /", "tags": ["x"]}))
            .await;
        assert!(!result.success);
    }

    #[test]
    fn test_describe_lists_parameters() {
        let registry = ToolRegistry::new().with_bead_tools(Arc::new(MemoryBeads::default()));
        let listing = registry.describe();
        let create = listing
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["name"] == "create_bead")
            .unwrap();
        assert!(create["parameters"]["properties"]["title"].is_object());
    }
}
