use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, RetryConfig};
use crate::error::BotError;

/// Attempt budget and backoff for the generation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let policy = RetryPolicy::from(&config.retry);
        Self {
            client: reqwest::Client::new(),
            config,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send `prompt` as a single user message and return the reply text,
    /// retrying transient failures per the configured policy.
    pub async fn complete(&self, prompt: &str) -> Result<String, BotError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut attempt = 1;
        loop {
            info!("LLM call attempt {}/{}", attempt, self.policy.max_attempts);
            match self.attempt(&request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "LLM attempt {} failed: {}; retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("LLM call failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, request: &ChatRequest<'_>) -> Result<String, BotError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .timeout(self.policy.attempt_timeout)
            .json(request)
            .send()
            .await
            .map_err(BotError::from_transport)?;

        let status = response.status();
        debug!("LLM response status: {}", status);
        let body = response.text().await.map_err(BotError::from_transport)?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(BotError::TransientProvider(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(BotError::PermanentProvider {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = serde_json::from_str(&body)
            .map_err(|e| BotError::MalformedProviderResponse(e.to_string()))?;
        extract_text(&data).ok_or_else(|| BotError::MalformedProviderResponse(truncate(&body, 200)))
    }
}

/// Pull the first candidate's text out of the common response shapes.
pub fn extract_text(data: &Value) -> Option<String> {
    let choice = data.pointer("/choices/0");
    let candidate = data.pointer("/candidates/0");

    [
        choice.and_then(|c| c.pointer("/message/content")),
        choice.and_then(|c| c.get("text")),
        data.get("output"),
        data.get("content"),
        candidate.and_then(|c| c.get("content")),
        candidate.and_then(|c| c.get("text")),
        candidate.and_then(|c| c.pointer("/content/parts/0/text")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .map(str::trim)
    .find(|text| !text.is_empty())
    .map(str::to_string)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
