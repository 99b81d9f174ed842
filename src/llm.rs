//! Structured-generation capability and implementations.
//!
//! Defines the [`ChatModel`] trait consumed by the mapping extractor, and
//! HTTP implementations for the OpenAI chat completions API (or any
//! OpenAI-compatible server via `llm.base_url`) and the Anthropic messages
//! API. The extractor owns prompt assembly and response validation; a
//! [`ChatModel`] only turns a (system, user) prompt pair into text.
//!
//! Retry strategy matches the embedding client: 429/5xx and network errors
//! retried with exponential backoff, other 4xx fatal.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::LlmConfig;

/// The structured-generation capability.
///
/// Implementations must be safe to share across concurrent chunk workers.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider-qualified model name (e.g. `"openai-gpt-4o-mini"`), recorded
    /// in output metadata.
    fn name(&self) -> String;
    /// Run one completion and return the raw response text.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// A no-op model that always returns errors; used when `llm.provider` is
/// `"disabled"`.
pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn name(&self) -> String {
        "disabled".to_string()
    }
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

// ============ Shared retry loop ============

/// Send `request` up to `max_retries + 1` times with exponential backoff,
/// handing successful responses to `parse`.
async fn send_with_retry(
    build: impl Fn() -> reqwest::RequestBuilder,
    max_retries: u32,
    parse: impl Fn(&serde_json::Value) -> Result<String>,
) -> Result<String> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("chat API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("chat API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat completion failed after retries")))
}

// ============ OpenAI-compatible chat ============

/// Chat model over the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable. Temperature is pinned
/// to zero; extraction needs reproducibility, not creativity.
pub struct OpenAiChat {
    model: String,
    base_url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> String {
        format!("openai-{}", self.model)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
        });

        send_with_retry(
            || {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
            },
            self.max_retries,
            |json| {
                json.get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("message"))
                    .and_then(|m| m.get("content"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string())
                    .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing content"))
            },
        )
        .await
    }
}

// ============ Anthropic messages ============

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Chat model over the Anthropic messages API.
///
/// Requires the `ANTHROPIC_API_KEY` environment variable.
pub struct AnthropicChat {
    model: String,
    api_key: String,
    max_output_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Anthropic provider"))?;
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            max_output_tokens: config.max_output_tokens,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
    fn name(&self) -> String {
        format!("anthropic-{}", self.model)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_output_tokens,
            "temperature": 0.0,
            "system": system,
            "messages": [
                { "role": "user", "content": user }
            ],
        });

        send_with_retry(
            || {
                self.client
                    .post(ANTHROPIC_API_URL)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("Content-Type", "application/json")
                    .json(&body)
            },
            self.max_retries,
            |json| {
                json.get("content")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("text"))
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_string())
                    .ok_or_else(|| anyhow::anyhow!("Invalid messages response: missing text"))
            },
        )
        .await
    }
}

/// Create the appropriate [`ChatModel`] based on configuration.
pub fn create_chat_model(config: &LlmConfig) -> Result<std::sync::Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledChat)),
        "openai" => Ok(std::sync::Arc::new(OpenAiChat::new(config)?)),
        "anthropic" => Ok(std::sync::Arc::new(AnthropicChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
