//! Regeneration: recover source text for an artifact and synthesize it again.

use std::sync::Arc;

use tracing::{debug, info};

use super::store::ArtifactStore;
use crate::error::UpstreamError;
use crate::reply_cache::ReplyTextCache;
use crate::retry::RetryPolicy;
use crate::speaker::completion::{primed_messages, CompletionService};
use crate::speaker::synthesis::SynthesisService;

/// Where regenerated text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    Sidecar,
    Cache,
    Expected,
    Completion,
}

impl TextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextSource::Sidecar => "sidecar",
            TextSource::Cache => "cache",
            TextSource::Expected => "expected",
            TextSource::Completion => "completion",
        }
    }
}

pub struct Regenerator {
    store: Arc<ArtifactStore>,
    cache: Arc<dyn ReplyTextCache>,
    completion: Arc<dyn CompletionService>,
    synthesis: Arc<dyn SynthesisService>,
    retry: RetryPolicy,
    persona: String,
    prompt: String,
}

impl Regenerator {
    pub fn new(
        store: Arc<ArtifactStore>,
        cache: Arc<dyn ReplyTextCache>,
        completion: Arc<dyn CompletionService>,
        synthesis: Arc<dyn SynthesisService>,
        retry: RetryPolicy,
        persona: String,
        prompt: String,
    ) -> Self {
        Self {
            store,
            cache,
            completion,
            synthesis,
            retry,
            persona,
            prompt,
        }
    }

    /// Text to synthesize without asking the completion service.
    ///
    /// Sidecar, then cache, then the caller's expected text. A stored
    /// candidate that disagrees with `expected` is stale and skipped.
    pub fn select_source_text(&self, name: &str, expected: Option<&str>) -> Option<(TextSource, String)> {
        let stored = [
            (TextSource::Sidecar, self.store.sidecar_text(name)),
            (TextSource::Cache, self.cache.get(name)),
        ];
        for (source, text) in stored {
            let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            match expected {
                Some(exp) if text != exp => {
                    debug!(artifact = name, source = source.as_str(), "Skipping stale source text");
                }
                _ => return Some((source, text)),
            }
        }
        expected
            .filter(|t| !t.trim().is_empty())
            .map(|t| (TextSource::Expected, t.to_string()))
    }

    /// Rebuild `name` in the ephemeral tier. Returns the text it now holds.
    ///
    /// Fails with `MissingCredential` before any network call when a
    /// service the run needs has no key.
    pub async fn regenerate(&self, name: &str, expected: Option<&str>) -> Result<String, UpstreamError> {
        if !self.synthesis.is_configured() {
            return Err(UpstreamError::MissingCredential { service: "synthesis" });
        }

        let (source, text) = match self.select_source_text(name, expected) {
            Some(found) => found,
            None => {
                if !self.completion.is_configured() {
                    return Err(UpstreamError::MissingCredential { service: "completion" });
                }
                let messages = primed_messages(&self.persona, &self.prompt);
                (TextSource::Completion, self.completion.complete(&messages).await?)
            }
        };

        info!(
            artifact = name,
            source = source.as_str(),
            chars = text.len(),
            "Regenerating artifact"
        );
        self.synthesize_and_store(name, &text).await?;
        Ok(text)
    }

    /// Synthesize `text` with retries, then write the artifact, its sidecar
    /// and the cache entry. Returns the audio size in bytes.
    pub async fn synthesize_and_store(&self, name: &str, text: &str) -> Result<usize, UpstreamError> {
        let audio = self
            .retry
            .run(
                "Synthesis",
                |attempt| {
                    debug!(artifact = name, attempt, "Requesting synthesis");
                    self.synthesis.synthesize(text)
                },
                UpstreamError::is_retryable,
            )
            .await?;

        self.store.write_ephemeral(name, &audio, text)?;
        self.cache.set(name, text);
        Ok(audio.len())
    }

    pub fn completion_configured(&self) -> bool {
        self.completion.is_configured()
    }

    pub fn synthesis_configured(&self) -> bool {
        self.synthesis.is_configured()
    }
}
