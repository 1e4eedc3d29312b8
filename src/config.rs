//! Configuration management for reply-audio-rs.
//!
//! Loads config from YAML files in standard locations, then applies
//! environment overrides for secrets and the deployment mode.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::retry::RetryPolicy;

/// Where the service runs. Picks the reply text cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Short-lived instances with no writable home: reply text lives in memory.
    Serverless,
    /// Long-running process: reply text persists to a JSON document.
    Standalone,
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serverless" => Ok(Self::Serverless),
            "standalone" => Ok(Self::Standalone),
            other => Err(format!("unknown deployment mode '{other}'")),
        }
    }
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serverless => "serverless",
            Self::Standalone => "standalone",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret identifying internal callers. Empty means loopback-only.
    pub internal_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8770,
            internal_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: DeploymentMode,
    pub ephemeral_dir: PathBuf,
    pub persistent_dir: PathBuf,
    pub cache_file: PathBuf,
    /// Artifact file extension, without the dot.
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reply-audio");
        Self {
            mode: DeploymentMode::Standalone,
            ephemeral_dir: std::env::temp_dir().join("reply-audio"),
            persistent_dir: PathBuf::from("public/audio"),
            cache_file: data_dir.join("reply-cache.json"),
            extension: "mp3".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
    pub capacity: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_secs: 15 * 60,
            capacity: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub host: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub persona: String,
    /// User turn sent when no source text exists for an artifact.
    pub regeneration_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            host: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            api_key: String::new(),
            timeout_secs: 20,
            persona: "You are a warm, concise voice assistant. Answer in two or three short \
                      conversational sentences that sound natural when read aloud."
                .into(),
            regeneration_prompt: "Say a short, friendly reply inviting the user to continue \
                                  the conversation."
                .into(),
            temperature: 0.7,
            max_tokens: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub host: String,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub api_key: String,
    /// Wrap text in SSML before sending it.
    pub ssml: bool,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// `fixed` waits `retry_delay_ms` between attempts, `exponential` doubles it.
    pub retry_backoff: String,
}

impl SynthesisConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        match self.retry_backoff.as_str() {
            "exponential" => RetryPolicy::exponential(self.max_attempts, delay, delay * 8),
            _ => RetryPolicy::fixed(self.max_attempts, delay),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            host: "https://api.openai.com".into(),
            model: "tts-1".into(),
            voice: "alloy".into(),
            speed: 1.0,
            api_key: String::new(),
            ssml: false,
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 500,
            retry_backoff: "fixed".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub completion: CompletionConfig,
    pub synthesis: SynthesisConfig,
    pub poll: PollConfig,
}

impl Config {
    /// Load configuration from YAML file, then apply environment overrides.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/reply-audio/config.yaml
    /// 3. /etc/reply-audio/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::load_file(path);
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn load_file(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/reply-audio/config.yaml")),
                Some(PathBuf::from("/etc/reply-audio/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }

    /// Overlay secrets and mode from the environment. `lookup` is
    /// `std::env::var` in production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("COMPLETION_API_KEY").filter(|v| !v.is_empty()) {
            self.completion.api_key = key;
        }
        if let Some(key) = lookup("SYNTHESIS_API_KEY").filter(|v| !v.is_empty()) {
            self.synthesis.api_key = key;
        }
        if let Some(token) = lookup("REPLY_AUDIO_INTERNAL_TOKEN").filter(|v| !v.is_empty()) {
            self.server.internal_token = token;
        }
        if let Some(raw) = lookup("REPLY_AUDIO_MODE") {
            match raw.parse::<DeploymentMode>() {
                Ok(mode) => self.storage.mode = mode,
                Err(e) => tracing::warn!("Ignoring REPLY_AUDIO_MODE: {e}"),
            }
        }
    }
}
