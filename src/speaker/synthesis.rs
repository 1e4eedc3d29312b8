//! Synthesis service client: text or SSML in, encoded audio out.
//!
//! Speaks the OpenAI-compatible `/v1/audio/speech` contract and asks for
//! MP3 output. Retries live in the caller; this client makes one attempt.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::error::UpstreamError;

const SERVICE: &str = "synthesis";

#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// False when no credential is configured; callers skip the network.
    fn is_configured(&self) -> bool;

    /// Turn reply text into audio bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, UpstreamError>;
}

pub struct SpeechClient {
    config: SynthesisConfig,
    client: Client,
}

impl SpeechClient {
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Exactly what goes in the request's `input` field.
    fn prepare_input(&self, text: &str) -> String {
        if self.config.ssml {
            to_ssml(text, self.config.speed)
        } else {
            text.trim().to_string()
        }
    }
}

#[async_trait]
impl SynthesisService for SpeechClient {
    fn is_configured(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, UpstreamError> {
        if !self.is_configured() {
            return Err(UpstreamError::MissingCredential { service: SERVICE });
        }
        let t_gen = Instant::now();

        let body = json!({
            "model": self.config.model,
            "input": self.prepare_input(text),
            "voice": self.config.voice,
            "speed": self.config.speed,
            "response_format": "mp3",
        });

        let url = format!("{}/v1/audio/speech", self.config.host.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                service: SERVICE,
                source,
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

        let audio = resp
            .bytes()
            .await
            .map_err(|source| UpstreamError::Transport {
                service: SERVICE,
                source,
            })?;
        if audio.is_empty() {
            return Err(UpstreamError::InvalidResponse {
                service: SERVICE,
                reason: "empty audio body".into(),
            });
        }

        let gen_ms = t_gen.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Synthesized {} chars into {} bytes ({gen_ms:.0}ms, voice: {})",
            text.len(),
            audio.len(),
            self.config.voice
        );
        Ok(audio.to_vec())
    }
}

/// Wrap plain text in an SSML document with a prosody rate.
pub fn to_ssml(text: &str, speed: f32) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    let rate = (speed * 100.0).round() as i32;
    format!("<speak><prosody rate=\"{rate}%\">{escaped}</prosody></speak>")
}
