//! Reply text cache: source text behind each generated artifact.
//!
//! Two backends share one contract. The in-memory map serves serverless
//! deployments, the JSON document serves standalone ones. Neither evicts,
//! and neither ever returns an error: failures are logged and read as a miss.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::DeploymentMode;

pub trait ReplyTextCache: Send + Sync {
    fn get(&self, artifact_id: &str) -> Option<String>;
    fn set(&self, artifact_id: &str, text: &str);
    fn delete(&self, artifact_id: &str);
    fn backend(&self) -> &'static str;
}

/// Pick the backend for a deployment mode.
pub fn for_mode(mode: DeploymentMode, cache_file: &Path) -> Arc<dyn ReplyTextCache> {
    match mode {
        DeploymentMode::Serverless => Arc::new(MemoryReplyCache::default()),
        DeploymentMode::Standalone => Arc::new(FileReplyCache::new(cache_file)),
    }
}

#[derive(Default)]
pub struct MemoryReplyCache {
    entries: Mutex<HashMap<String, String>>,
}

impl ReplyTextCache for MemoryReplyCache {
    fn get(&self, artifact_id: &str) -> Option<String> {
        self.entries.lock().ok()?.get(artifact_id).cloned()
    }

    fn set(&self, artifact_id: &str, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(artifact_id.to_string(), text.to_string());
        }
    }

    fn delete(&self, artifact_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(artifact_id);
        }
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Whole-document JSON cache: `{ "<artifact id>": "<text>", ... }`.
///
/// Every write reads the full document, changes one key, and rewrites it.
/// Two concurrent writers can lose each other's update.
pub struct FileReplyCache {
    path: PathBuf,
}

impl FileReplyCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_document(&self) -> HashMap<String, String> {
        match fs::read_to_string(&self.path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Reply cache {} is corrupt, treating as empty: {e}", self.path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("Failed to read reply cache {}: {e}", self.path.display());
                HashMap::new()
            }
        }
    }

    fn write_document(&self, doc: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("Failed to create reply cache dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(doc) {
            Ok(data) => {
                if let Err(e) = fs::write(&self.path, data) {
                    warn!("Failed to write reply cache {}: {e}", self.path.display());
                }
            }
            Err(e) => warn!("Failed to serialize reply cache: {e}"),
        }
    }
}

impl ReplyTextCache for FileReplyCache {
    fn get(&self, artifact_id: &str) -> Option<String> {
        self.read_document().remove(artifact_id)
    }

    fn set(&self, artifact_id: &str, text: &str) {
        let mut doc = self.read_document();
        doc.insert(artifact_id.to_string(), text.to_string());
        self.write_document(&doc);
        debug!(artifact_id, entries = doc.len(), "Reply text cached");
    }

    fn delete(&self, artifact_id: &str) {
        let mut doc = self.read_document();
        if doc.remove(artifact_id).is_some() {
            self.write_document(&doc);
        }
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(cache: &dyn ReplyTextCache) {
        assert_eq!(cache.get("a.mp3"), None);
        cache.set("a.mp3", "first");
        assert_eq!(cache.get("a.mp3").as_deref(), Some("first"));
        cache.set("a.mp3", "second");
        assert_eq!(cache.get("a.mp3").as_deref(), Some("second"));
        cache.delete("a.mp3");
        assert_eq!(cache.get("a.mp3"), None);
        // Deleting a missing key is a no-op.
        cache.delete("a.mp3");
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryReplyCache::default());
    }

    #[test]
    fn file_backend_contract() {
        let dir = TempDir::new().unwrap();
        exercise(&FileReplyCache::new(dir.path().join("nested/cache.json")));
    }

    #[test]
    fn file_backend_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        FileReplyCache::new(&path).set("b.mp3", "hello there");
        assert_eq!(
            FileReplyCache::new(&path).get("b.mp3").as_deref(),
            Some("hello there")
        );
        let raw: HashMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["b.mp3"], "hello there");
    }

    #[test]
    fn corrupt_document_reads_as_miss_and_is_replaced_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not json").unwrap();
        let cache = FileReplyCache::new(&path);
        assert_eq!(cache.get("x"), None);
        cache.set("x", "fresh");
        assert_eq!(cache.get("x").as_deref(), Some("fresh"));
    }

    #[test]
    fn unwritable_location_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        // Parent is a regular file, so the directory cannot be created.
        let cache = FileReplyCache::new(blocker.join("cache.json"));
        cache.set("x", "lost");
        assert_eq!(cache.get("x"), None);
    }

    #[test]
    fn entries_are_never_evicted() {
        let cache = MemoryReplyCache::default();
        for i in 0..10_000 {
            cache.set(&format!("{i}.mp3"), "text");
        }
        assert_eq!(cache.entries.lock().unwrap().len(), 10_000);
        assert_eq!(cache.get("0.mp3").as_deref(), Some("text"));
    }

    #[test]
    fn backend_follows_deployment_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        assert_eq!(for_mode(DeploymentMode::Serverless, &path).backend(), "memory");
        assert_eq!(for_mode(DeploymentMode::Standalone, &path).backend(), "file");
    }
}
