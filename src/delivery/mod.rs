//! Audio delivery: serve reply audio, regenerating it when missing or stale.
//!
//! Components:
//! - `store`: two-tier artifact lookup with containment checks
//! - `regenerate`: source text recovery and synthesis with retries
//!
//! `AudioDelivery::resolve` looks the artifact up, regenerates on a miss or
//! a text mismatch, then waits for the artifact to become visible before
//! serving it.

pub mod regenerate;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DeliveryError, UpstreamError};
use crate::reply_cache::ReplyTextCache;
use crate::retry::{wait_until, PollOutcome, RetryPolicy};
use crate::speaker::completion::CompletionService;
use crate::speaker::synthesis::SynthesisService;

use regenerate::Regenerator;
use store::{ArtifactStore, Located, Tier};

pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

#[derive(Debug)]
pub struct AudioPayload {
    pub name: String,
    pub tier: Tier,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSpeech {
    pub name: String,
    pub bytes: usize,
}

/// Tunables for regeneration and the post-regeneration wait.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub persona: String,
    pub regeneration_prompt: String,
}

impl DeliverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.synthesis.retry_policy(),
            poll_interval: Duration::from_millis(config.poll.interval_ms),
            poll_attempts: config.poll.max_attempts,
            persona: config.completion.persona.clone(),
            regeneration_prompt: config.completion.regeneration_prompt.clone(),
        }
    }
}

pub struct AudioDelivery {
    store: Arc<ArtifactStore>,
    cache: Arc<dyn ReplyTextCache>,
    regenerator: Regenerator,
    poll_interval: Duration,
    poll_attempts: u32,
    shutdown: CancellationToken,
}

impl AudioDelivery {
    pub fn new(
        store: Arc<ArtifactStore>,
        cache: Arc<dyn ReplyTextCache>,
        completion: Arc<dyn CompletionService>,
        synthesis: Arc<dyn SynthesisService>,
        settings: DeliverySettings,
        shutdown: CancellationToken,
    ) -> Self {
        let regenerator = Regenerator::new(
            store.clone(),
            cache.clone(),
            completion,
            synthesis,
            settings.retry,
            settings.persona,
            settings.regeneration_prompt,
        );
        Self {
            store,
            cache,
            regenerator,
            poll_interval: settings.poll_interval,
            poll_attempts: settings.poll_attempts,
            shutdown,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn cache_backend(&self) -> &'static str {
        self.cache.backend()
    }

    pub fn completion_configured(&self) -> bool {
        self.regenerator.completion_configured()
    }

    pub fn synthesis_configured(&self) -> bool {
        self.regenerator.synthesis_configured()
    }

    /// Serve the artifact for `file`, regenerating it if it is missing or
    /// its sidecar text differs from `expected`.
    pub async fn resolve(
        &self,
        file: Option<&str>,
        expected: Option<&str>,
    ) -> Result<AudioPayload, DeliveryError> {
        let name = self.store.sanitize(file.unwrap_or_default())?;
        let expected = expected.filter(|t| !t.trim().is_empty());

        if let Some(found) = self.store.locate(&name)? {
            if self.is_current(&found, expected) {
                return self.serve(name, &found);
            }
            info!(
                artifact = %name,
                tier = found.tier.as_str(),
                "Artifact text is stale, regenerating"
            );
        } else {
            info!(artifact = %name, "Artifact missing, regenerating");
        }

        match self.regenerator.regenerate(&name, expected).await {
            Ok(_) => {}
            Err(e @ UpstreamError::MissingCredential { .. }) => {
                warn!(artifact = %name, "Cannot regenerate: {e}");
                return Err(DeliveryError::NotFound(name));
            }
            Err(e) => warn!(artifact = %name, "Regeneration failed: {e}"),
        }

        let cancel = self.shutdown.child_token();
        let mut escaped = None;
        let outcome = wait_until(self.poll_interval, self.poll_attempts, &cancel, || {
            let ready = match self.is_ready(&name, expected) {
                Ok(ready) => ready,
                Err(e) => {
                    escaped = Some(e);
                    true
                }
            };
            std::future::ready(ready)
        })
        .await;
        if let Some(e) = escaped {
            warn!(artifact = %name, "Regenerated artifact escaped its tier");
            return Err(e);
        }

        match outcome {
            PollOutcome::Found => match self.store.locate(&name)? {
                Some(found) => self.serve(name, &found),
                None => Err(DeliveryError::NotFound(name)),
            },
            PollOutcome::NotFound => {
                warn!(artifact = %name, attempts = self.poll_attempts, "Artifact never materialized");
                Err(DeliveryError::NotFound(name))
            }
            PollOutcome::Cancelled => {
                info!(artifact = %name, "Wait for artifact cancelled");
                Err(DeliveryError::NotFound(name))
            }
        }
    }

    /// Synthesize `text` as the new current artifact for `file`.
    pub async fn create(&self, file: &str, text: &str) -> Result<CreatedSpeech, DeliveryError> {
        let name = self.store.sanitize(file)?;
        if text.trim().is_empty() {
            return Err(DeliveryError::Validation("Text parameter is required".into()));
        }
        if !self.synthesis_configured() {
            warn!(artifact = %name, "Synthesis credential is not configured");
            return Err(DeliveryError::Unavailable(name));
        }

        match self.regenerator.synthesize_and_store(&name, text).await {
            Ok(bytes) => {
                info!(artifact = %name, bytes, "Speech created");
                Ok(CreatedSpeech { name, bytes })
            }
            Err(e) => {
                warn!(artifact = %name, "Speech creation failed: {e}");
                Err(DeliveryError::Unavailable(name))
            }
        }
    }

    /// Drop the cached reply text for `file`. Artifacts are left alone.
    pub fn forget(&self, file: &str) -> Result<String, DeliveryError> {
        let name = self.store.sanitize(file)?;
        self.cache.delete(&name);
        debug!(artifact = %name, "Reply text forgotten");
        Ok(name)
    }

    fn is_current(&self, found: &Located, expected: Option<&str>) -> bool {
        match expected {
            None => true,
            Some(exp) => self
                .store
                .read_sidecar(found)
                .is_some_and(|text| text == exp),
        }
    }

    /// Whether the wait can end. Containment failures end it with an error.
    fn is_ready(&self, name: &str, expected: Option<&str>) -> Result<bool, DeliveryError> {
        match self.store.locate(name) {
            Ok(Some(found)) => Ok(self.is_current(&found, expected)),
            Ok(None) => Ok(false),
            Err(e @ DeliveryError::Forbidden(_)) => Err(e),
            Err(e) => {
                debug!(artifact = name, "Artifact not readable yet: {e}");
                Ok(false)
            }
        }
    }

    fn serve(&self, name: String, found: &Located) -> Result<AudioPayload, DeliveryError> {
        match self.store.read(found) {
            Ok(bytes) => Ok(AudioPayload {
                name,
                tier: found.tier,
                bytes,
            }),
            Err(e) => {
                warn!(artifact = %name, "Failed to read {}: {e}", found.path.display());
                Err(DeliveryError::Internal(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reply_cache::MemoryReplyCache;
    use crate::speaker::completion::ChatMessage;
    use async_trait::async_trait;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    pub struct FakeCompletion {
        pub configured: bool,
        pub reply: String,
        pub calls: AtomicU32,
        pub last_messages: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl CompletionService for FakeCompletion {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = messages.to_vec();
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    pub struct FakeSynthesis {
        pub configured: bool,
        /// Number of leading calls that fail with a retryable 503.
        pub failures: AtomicU32,
        pub delay: Duration,
        pub calls: AtomicU32,
        pub texts: Mutex<Vec<String>>,
    }

    impl FakeSynthesis {
        pub fn working() -> Self {
            Self {
                configured: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SynthesisService for FakeSynthesis {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.lock().unwrap().push(text.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(UpstreamError::Status {
                    service: "synthesis",
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            Ok(format!("mp3:{text}").into_bytes())
        }
    }

    fn fast_settings() -> DeliverySettings {
        DeliverySettings {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            poll_interval: Duration::from_millis(1),
            poll_attempts: 5,
            persona: "You are a test persona.".into(),
            regeneration_prompt: "Say something.".into(),
        }
    }

    pub struct Harness {
        pub dir: TempDir,
        pub cache: Arc<MemoryReplyCache>,
        pub completion: Arc<FakeCompletion>,
        pub synthesis: Arc<FakeSynthesis>,
        pub shutdown: CancellationToken,
        pub delivery: Arc<AudioDelivery>,
    }

    impl Harness {
        pub fn new(completion: FakeCompletion, synthesis: FakeSynthesis) -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(ArtifactStore::new(
                dir.path().join("tmp"),
                dir.path().join("public"),
                "mp3",
            ));
            fs::create_dir_all(store.root(Tier::Ephemeral)).unwrap();
            fs::create_dir_all(store.root(Tier::Persistent)).unwrap();

            let cache = Arc::new(MemoryReplyCache::default());
            let completion = Arc::new(completion);
            let synthesis = Arc::new(synthesis);
            let shutdown = CancellationToken::new();
            let delivery = Arc::new(AudioDelivery::new(
                store,
                cache.clone(),
                completion.clone(),
                synthesis.clone(),
                fast_settings(),
                shutdown.clone(),
            ));
            Self {
                dir,
                cache,
                completion,
                synthesis,
                shutdown,
                delivery,
            }
        }

        pub fn tier(&self, tier: Tier) -> PathBuf {
            self.delivery.store().root(tier).to_path_buf()
        }

        pub fn put(&self, tier: Tier, name: &str, audio: &[u8], sidecar: Option<&str>) {
            let root = self.tier(tier);
            fs::write(root.join(name), audio).unwrap();
            if let Some(text) = sidecar {
                fs::write(root.join(name).with_extension("txt"), text).unwrap();
            }
        }

        pub fn completion_calls(&self) -> u32 {
            self.completion.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn missing_artifact_without_credentials_is_not_found() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        let err = h.delivery.resolve(Some("missing.mp3"), None).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 404);
        assert_eq!(
            err.public_message(),
            "File not found after all regeneration attempts"
        );
        assert_eq!(h.completion_calls(), 0);
        assert_eq!(h.synthesis.calls(), 0);
    }

    #[tokio::test]
    async fn matching_sidecar_is_served_without_synthesis() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.put(Tier::Ephemeral, "a.mp3", b"stored", Some("MATCHING REPLY"));

        let payload = h
            .delivery
            .resolve(Some("a.mp3"), Some("MATCHING REPLY"))
            .await
            .unwrap();
        assert_eq!(payload.bytes, b"stored");
        assert_eq!(payload.tier, Tier::Ephemeral);
        assert_eq!(h.synthesis.calls(), 0);
        assert_eq!(h.completion_calls(), 0);
    }

    #[tokio::test]
    async fn stale_sidecar_is_resynthesized_with_expected_text() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.put(Tier::Ephemeral, "a.mp3", b"old audio", Some("OLD REPLY"));

        let payload = h
            .delivery
            .resolve(Some("a.mp3"), Some("EXPECTED"))
            .await
            .unwrap();

        assert_eq!(h.synthesis.calls(), 1);
        assert!(h.synthesis.texts.lock().unwrap()[0].contains("EXPECTED"));
        assert_eq!(payload.bytes, b"mp3:EXPECTED");
        let sidecar = fs::read_to_string(h.tier(Tier::Ephemeral).join("a.txt")).unwrap();
        assert_eq!(sidecar, "EXPECTED");
        assert_eq!(h.cache.get("a.mp3").as_deref(), Some("EXPECTED"));
    }

    #[tokio::test]
    async fn sidecar_differing_only_in_whitespace_is_stale() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.put(Tier::Ephemeral, "a.mp3", b"old audio", Some("EXPECTED\n"));

        let payload = h
            .delivery
            .resolve(Some("a.mp3"), Some("EXPECTED"))
            .await
            .unwrap();

        assert_eq!(h.synthesis.calls(), 1);
        assert_eq!(payload.bytes, b"mp3:EXPECTED");
        let sidecar = fs::read_to_string(h.tier(Tier::Ephemeral).join("a.txt")).unwrap();
        assert_eq!(sidecar, "EXPECTED");

        // Served as is on the next request.
        h.delivery.resolve(Some("a.mp3"), Some("EXPECTED")).await.unwrap();
        assert_eq!(h.synthesis.calls(), 1);
    }

    #[tokio::test]
    async fn padded_expected_text_is_stored_verbatim() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());

        let payload = h
            .delivery
            .resolve(Some("p.mp3"), Some("  NEW  "))
            .await
            .unwrap();

        assert_eq!(payload.bytes, b"mp3:  NEW  ");
        let sidecar = fs::read_to_string(h.tier(Tier::Ephemeral).join("p.txt")).unwrap();
        assert_eq!(sidecar, "  NEW  ");
        assert_eq!(h.cache.get("p.mp3").as_deref(), Some("  NEW  "));

        h.delivery.resolve(Some("p.mp3"), Some("  NEW  ")).await.unwrap();
        assert_eq!(h.synthesis.calls(), 1);
    }

    #[tokio::test]
    async fn existing_artifact_in_either_tier_never_calls_services() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.put(Tier::Persistent, "bundled.mp3", b"bundled bytes", None);
        h.put(Tier::Ephemeral, "fresh.mp3", b"fresh bytes", Some("hi"));

        let bundled = h.delivery.resolve(Some("bundled.mp3"), None).await.unwrap();
        assert_eq!(bundled.bytes, b"bundled bytes");
        assert_eq!(bundled.tier, Tier::Persistent);

        let fresh = h.delivery.resolve(Some("fresh"), Some("hi")).await.unwrap();
        assert_eq!(fresh.bytes, b"fresh bytes");
        assert_eq!(fresh.name, "fresh.mp3");

        assert_eq!(h.synthesis.calls(), 0);
        assert_eq!(h.completion_calls(), 0);
    }

    #[tokio::test]
    async fn cached_text_regenerates_once_then_serves_from_tier() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.cache.set("b.mp3", "cached reply");

        let first = h.delivery.resolve(Some("b.mp3"), None).await.unwrap();
        assert_eq!(first.bytes, b"mp3:cached reply");
        assert_eq!(first.tier, Tier::Ephemeral);
        assert_eq!(h.synthesis.calls(), 1);

        let second = h.delivery.resolve(Some("b.mp3"), None).await.unwrap();
        assert_eq!(second.bytes, first.bytes);
        assert_eq!(h.synthesis.calls(), 1);
        assert_eq!(h.completion_calls(), 0);
    }

    #[tokio::test]
    async fn completion_supplies_text_when_nothing_is_stored() {
        let completion = FakeCompletion {
            configured: true,
            reply: "A brand new reply.".into(),
            ..FakeCompletion::default()
        };
        let h = Harness::new(completion, FakeSynthesis::working());

        let payload = h.delivery.resolve(Some("c.mp3"), None).await.unwrap();
        assert_eq!(payload.bytes, b"mp3:A brand new reply.");
        assert_eq!(h.completion_calls(), 1);

        let messages = h.completion.last_messages.lock().unwrap().clone();
        assert_eq!(messages[0].content, "You are a test persona.");
        assert_eq!(messages[1].content, "Say something.");
        assert_eq!(h.cache.get("c.mp3").as_deref(), Some("A brand new reply."));
    }

    #[tokio::test]
    async fn missing_synthesis_credential_skips_every_service() {
        let completion = FakeCompletion {
            configured: true,
            reply: "unused".into(),
            ..FakeCompletion::default()
        };
        let h = Harness::new(completion, FakeSynthesis::default());
        h.cache.set("d.mp3", "cached");

        let err = h.delivery.resolve(Some("d.mp3"), None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
        assert_eq!(h.completion_calls(), 0);
        assert_eq!(h.synthesis.calls(), 0);
    }

    #[tokio::test]
    async fn transient_synthesis_failures_are_retried() {
        let synthesis = FakeSynthesis::working();
        synthesis.failures.store(2, Ordering::SeqCst);
        let h = Harness::new(FakeCompletion::default(), synthesis);
        h.cache.set("e.mp3", "retry me");

        let payload = h.delivery.resolve(Some("e.mp3"), None).await.unwrap();
        assert_eq!(payload.bytes, b"mp3:retry me");
        assert_eq!(h.synthesis.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_synthesis_retries_end_in_not_found() {
        let synthesis = FakeSynthesis::working();
        synthesis.failures.store(10, Ordering::SeqCst);
        let h = Harness::new(FakeCompletion::default(), synthesis);
        h.cache.set("f.mp3", "never works");

        let err = h.delivery.resolve(Some("f.mp3"), None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
        assert_eq!(h.synthesis.calls(), 3);
        assert!(!h.tier(Tier::Ephemeral).join("f.mp3").exists());
    }

    #[tokio::test]
    async fn sidecar_wins_over_diverging_cache_entry() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        // Sidecar survives the artifact it belonged to.
        fs::write(h.tier(Tier::Ephemeral).join("g.txt"), "sidecar text").unwrap();
        h.cache.set("g.mp3", "cache text");

        h.delivery.resolve(Some("g.mp3"), None).await.unwrap();
        assert_eq!(
            h.synthesis.texts.lock().unwrap().as_slice(),
            ["sidecar text".to_string()]
        );
        assert_eq!(h.cache.get("g.mp3").as_deref(), Some("sidecar text"));
    }

    #[tokio::test]
    async fn diverging_cache_entry_matching_expected_is_used() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        fs::write(h.tier(Tier::Ephemeral).join("h.txt"), "stale sidecar").unwrap();
        h.cache.set("h.mp3", "current text");

        h.delivery
            .resolve(Some("h.mp3"), Some("current text"))
            .await
            .unwrap();
        assert_eq!(
            h.synthesis.texts.lock().unwrap().as_slice(),
            ["current text".to_string()]
        );
    }

    #[tokio::test]
    async fn regeneration_sweeps_the_previous_artifact() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.put(Tier::Ephemeral, "old.mp3", b"old", Some("old text"));
        h.cache.set("new.mp3", "new text");

        h.delivery.resolve(Some("new.mp3"), None).await.unwrap();
        assert!(!h.tier(Tier::Ephemeral).join("old.mp3").exists());

        // The swept artifact comes back from its surviving sidecar.
        let again = h.delivery.resolve(Some("old.mp3"), None).await.unwrap();
        assert_eq!(again.bytes, b"mp3:old text");
    }

    #[tokio::test]
    async fn concurrent_misses_both_regenerate_and_succeed() {
        let synthesis = FakeSynthesis {
            delay: Duration::from_millis(20),
            ..FakeSynthesis::working()
        };
        let h = Harness::new(FakeCompletion::default(), synthesis);
        h.cache.set("dup.mp3", "same text");

        let (a, b) = tokio::join!(
            h.delivery.resolve(Some("dup.mp3"), None),
            h.delivery.resolve(Some("dup.mp3"), None)
        );
        assert_eq!(a.unwrap().bytes, b"mp3:same text");
        assert_eq!(b.unwrap().bytes, b"mp3:same text");
        assert_eq!(h.synthesis.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_wait_reports_not_found() {
        let synthesis = FakeSynthesis::working();
        synthesis.failures.store(10, Ordering::SeqCst);
        let h = Harness::new(FakeCompletion::default(), synthesis);
        h.cache.set("i.mp3", "text");
        h.shutdown.cancel();

        let err = h.delivery.resolve(Some("i.mp3"), None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn unreadable_artifact_is_internal_error() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        fs::create_dir(h.tier(Tier::Ephemeral).join("dir.mp3")).unwrap();

        let err = h.delivery.resolve(Some("dir.mp3"), None).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 500);
        assert_eq!(err.public_message(), "Error reading file");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn escaping_symlink_is_forbidden_before_any_regeneration() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        let outside = h.dir.path().join("outside.mp3");
        fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, h.tier(Tier::Ephemeral).join("evil.mp3")).unwrap();
        h.cache.set("evil.mp3", "text");

        let err = h.delivery.resolve(Some("evil.mp3"), None).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 403);
        assert_eq!(h.synthesis.calls(), 0);
    }

    /// Reply cache that swaps the ephemeral artifact for a symlink leaving
    /// the tier as soon as regeneration records its text.
    #[cfg(unix)]
    struct EscapingCache {
        inner: MemoryReplyCache,
        tier: PathBuf,
        outside: PathBuf,
    }

    #[cfg(unix)]
    impl ReplyTextCache for EscapingCache {
        fn get(&self, artifact_id: &str) -> Option<String> {
            self.inner.get(artifact_id)
        }

        fn set(&self, artifact_id: &str, text: &str) {
            self.inner.set(artifact_id, text);
            let artifact = self.tier.join(artifact_id);
            fs::remove_file(&artifact).unwrap();
            std::os::unix::fs::symlink(&self.outside, &artifact).unwrap();
        }

        fn delete(&self, artifact_id: &str) {
            self.inner.delete(artifact_id);
        }

        fn backend(&self) -> &'static str {
            "escaping"
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn artifact_escaping_after_regeneration_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(
            dir.path().join("tmp"),
            dir.path().join("public"),
            "mp3",
        ));
        fs::create_dir_all(store.root(Tier::Ephemeral)).unwrap();
        fs::create_dir_all(store.root(Tier::Persistent)).unwrap();
        let outside = dir.path().join("outside.mp3");
        fs::write(&outside, b"secret").unwrap();

        let cache = EscapingCache {
            inner: MemoryReplyCache::default(),
            tier: store.root(Tier::Ephemeral).to_path_buf(),
            outside,
        };
        cache.inner.set("late.mp3", "stored reply");
        let synthesis = Arc::new(FakeSynthesis::working());
        let delivery = AudioDelivery::new(
            store,
            Arc::new(cache),
            Arc::new(FakeCompletion::default()),
            synthesis.clone(),
            fast_settings(),
            CancellationToken::new(),
        );

        let err = delivery.resolve(Some("late.mp3"), None).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 403);
        assert_eq!(synthesis.calls(), 1);
    }

    #[tokio::test]
    async fn missing_file_parameter_is_validation_error() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        let err = h.delivery.resolve(None, None).await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
        assert_eq!(err.public_message(), "File parameter is required");
    }

    #[tokio::test]
    async fn create_writes_artifact_sidecar_and_cache() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        let created = h.delivery.create("reply-1", "Hello there.").await.unwrap();
        assert_eq!(
            created,
            CreatedSpeech {
                name: "reply-1.mp3".into(),
                bytes: "mp3:Hello there.".len(),
            }
        );
        assert_eq!(h.cache.get("reply-1.mp3").as_deref(), Some("Hello there."));

        let payload = h
            .delivery
            .resolve(Some("reply-1.mp3"), Some("Hello there."))
            .await
            .unwrap();
        assert_eq!(payload.bytes, b"mp3:Hello there.");
        assert_eq!(h.synthesis.calls(), 1);
    }

    #[tokio::test]
    async fn create_rejects_blank_text_and_reports_unavailable_synthesis() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::default());
        let err = h.delivery.create("x.mp3", "   ").await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);

        let err = h.delivery.create("x.mp3", "hello").await.unwrap_err();
        assert_eq!(err.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn forget_removes_cached_text_only() {
        let h = Harness::new(FakeCompletion::default(), FakeSynthesis::working());
        h.delivery.create("j.mp3", "keep audio").await.unwrap();
        assert_eq!(h.delivery.forget("j").unwrap(), "j.mp3");
        assert_eq!(h.cache.get("j.mp3"), None);
        assert!(h.tier(Tier::Ephemeral).join("j.mp3").exists());
    }
}
