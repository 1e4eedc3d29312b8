//! Completion service client: role-tagged messages in, reply text out.
//!
//! Speaks the OpenAI-compatible `/v1/chat/completions` contract. One attempt
//! per call, bounded by the configured timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::CompletionConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Persona-primed conversation: system turn, then one user turn.
pub fn primed_messages(persona: &str, prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(Role::System, persona),
        ChatMessage::new(Role::User, prompt),
    ]
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// False when no credential is configured; callers skip the network.
    fn is_configured(&self) -> bool;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError>;
}

pub struct ChatCompletionClient {
    config: CompletionConfig,
    client: Client,
}

impl ChatCompletionClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl CompletionService for ChatCompletionClient {
    fn is_configured(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError> {
        if !self.is_configured() {
            return Err(UpstreamError::MissingCredential { service: SERVICE });
        }
        let t_start = Instant::now();

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let url = format!("{}/v1/chat/completions", self.config.host.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    warn!("Completion request timed out after {}s", self.config.timeout_secs);
                }
                UpstreamError::Transport {
                    service: SERVICE,
                    source,
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| UpstreamError::InvalidResponse {
            service: SERVICE,
            reason: e.to_string(),
        })?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(UpstreamError::InvalidResponse {
                service: SERVICE,
                reason: "empty completion".into(),
            });
        }

        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        info!("Completion produced {} chars ({latency_ms:.0}ms)", text.len());
        Ok(text)
    }
}
