//! # Model Client
//!
//! The seam between the engine and whatever answers prompts. The engine only
//! needs text back plus token counts, so `LlmClient` is a single async call;
//! `AnthropicClient` implements it over the Messages HTTP API, either
//! directly or through a LiteLLM router.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{strip_provider, ModelConfig};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MIN_THINKING_BUDGET: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One model call
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub extended_thinking: bool,
}

impl CompletionRequest {
    /// Single-prompt request against a model config
    pub fn prompt(config: &ModelConfig, prompt: impl Into<String>) -> Self {
        Self::conversation(config, vec![ChatMessage::user(prompt)])
    }

    pub fn conversation(config: &ModelConfig, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: config.model.clone(),
            system: None,
            messages,
            max_tokens: config.max_tokens,
            extended_thinking: config.extended_thinking,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Text of the last user message
    pub fn last_prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Model reply with usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Model that answered, as reported by the API
    pub model: String,
}

/// Anything that can answer a prompt
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one request. Failures are opaque to callers.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// HTTP settings for [`AnthropicClient`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    /// Router base URL; `None` talks to api.anthropic.com directly
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            timeout_secs: 300,
            connect_timeout_secs: 10,
            max_retries: 5,
        }
    }
}

impl AnthropicConfig {
    /// Key from `LITELLM_API_KEY` or `ANTHROPIC_API_KEY`, router from `LITELLM_BASE_URL`
    pub fn from_env() -> Self {
        let api_key = std::env::var("LITELLM_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .unwrap_or_default();
        let base_url = std::env::var("LITELLM_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Self {
            api_key,
            base_url,
            ..Self::default()
        }
    }
}

/// Messages API client
pub struct AnthropicClient {
    config: AnthropicConfig,
    client: Client,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(anyhow!(
                "API key is required. Set LITELLM_API_KEY or ANTHROPIC_API_KEY."
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(AnthropicConfig::from_env())
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/');
        format!("{}/v1/messages", base)
    }

    /// The router understands `anthropic/` ids; the API itself does not
    fn wire_model<'a>(&self, model: &'a str) -> &'a str {
        if self.config.base_url.is_some() {
            model
        } else {
            strip_provider(model)
        }
    }

    async fn try_request(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, RequestError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::Retryable(anyhow!(e).context("Failed to send request")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let err = anyhow!("Model API error ({}): {}", status, error_text);
            return Err(if is_retryable(status) {
                RequestError::Retryable(err)
            } else {
                RequestError::Fatal(err)
            });
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| RequestError::Fatal(anyhow!(e).context("Failed to parse model API response")))
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let thinking = request.extended_thinking.then(|| Thinking {
            kind: "enabled",
            budget_tokens: (request.max_tokens / 2).max(MIN_THINKING_BUDGET),
        });
        let max_tokens = match &thinking {
            Some(t) if request.max_tokens <= t.budget_tokens => t.budget_tokens + request.max_tokens,
            _ => request.max_tokens,
        };
        let body = MessagesRequest {
            model: self.wire_model(&request.model),
            system: request.system.as_deref(),
            messages: &request.messages,
            max_tokens,
            thinking,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ...
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tokio::time::sleep(delay).await;
            }

            match self.try_request(&body).await {
                Ok(response) => {
                    let text = response
                        .content
                        .iter()
                        .filter(|block| block.kind == "text")
                        .filter_map(|block| block.text.as_deref())
                        .collect::<Vec<_>>()
                        .join("");
                    return Ok(Completion {
                        text,
                        input_tokens: response.usage.input_tokens,
                        output_tokens: response.usage.output_tokens,
                        model: response.model,
                    });
                }
                Err(RequestError::Fatal(e)) => return Err(e),
                Err(RequestError::Retryable(e)) => {
                    if attempt < self.config.max_retries {
                        tracing::warn!(
                            attempt = attempt + 1,
                            max = self.config.max_retries + 1,
                            error = %e,
                            "Model request failed, retrying"
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All retry attempts failed")))
    }
}

enum RequestError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

// Messages API wire types

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
}

#[derive(Debug, Serialize)]
struct Thinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}
