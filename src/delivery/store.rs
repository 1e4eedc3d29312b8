//! Two-tier artifact storage with path containment.
//!
//! The ephemeral tier is the writable working directory; at most one current
//! artifact lives there. The persistent tier holds bundled artifacts and is
//! never written. Every artifact may carry a sidecar `.txt` with the same
//! stem holding the text it was synthesized from.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::DeliveryError;

const SIDECAR_EXTENSION: &str = "txt";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Ephemeral,
    Persistent,
}

impl Tier {
    /// Lookup order.
    pub const ALL: [Tier; 2] = [Tier::Ephemeral, Tier::Persistent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Ephemeral => "ephemeral",
            Tier::Persistent => "persistent",
        }
    }
}

/// An artifact that exists and stays inside its tier root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub tier: Tier,
    pub path: PathBuf,
}

pub struct ArtifactStore {
    ephemeral: PathBuf,
    persistent: PathBuf,
    extension: String,
}

impl ArtifactStore {
    pub fn new(ephemeral: impl Into<PathBuf>, persistent: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            ephemeral: ephemeral.into(),
            persistent: persistent.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.ephemeral_dir, &config.persistent_dir, &config.extension)
    }

    pub fn root(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Ephemeral => &self.ephemeral,
            Tier::Persistent => &self.persistent,
        }
    }

    /// Reduce a caller-supplied id to a bare file name with the artifact
    /// extension. Directory components are dropped.
    pub fn sanitize(&self, raw: &str) -> Result<String, DeliveryError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DeliveryError::Validation("File parameter is required".into()));
        }
        let base = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default();
        if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
            return Err(DeliveryError::Validation("Invalid file parameter".into()));
        }

        let has_extension = Path::new(base)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension.as_str()));
        if has_extension {
            Ok(base.to_string())
        } else {
            Ok(format!("{base}.{}", self.extension))
        }
    }

    /// Find `name` in the ephemeral tier, then the persistent one.
    ///
    /// An existing candidate whose real path leaves its tier root is
    /// `Forbidden`, whichever tier it is in.
    pub fn locate(&self, name: &str) -> Result<Option<Located>, DeliveryError> {
        for tier in Tier::ALL {
            let candidate = self.root(tier).join(name);
            if !candidate.exists() {
                continue;
            }
            let contained = self
                .is_contained(tier, &candidate)
                .map_err(DeliveryError::Internal)?;
            if !contained {
                warn!(
                    artifact = name,
                    tier = tier.as_str(),
                    "Artifact path escapes its tier root"
                );
                return Err(DeliveryError::Forbidden(name.to_string()));
            }
            return Ok(Some(Located {
                tier,
                path: candidate,
            }));
        }
        Ok(None)
    }

    pub fn read(&self, located: &Located) -> io::Result<Vec<u8>> {
        fs::read(&located.path)
    }

    /// Sidecar text next to a located artifact.
    pub fn read_sidecar(&self, located: &Located) -> Option<String> {
        self.sidecar_at(located.tier, &located.path.with_extension(SIDECAR_EXTENSION))
    }

    /// Sidecar text for `name`, whether or not its artifact still exists.
    pub fn sidecar_text(&self, name: &str) -> Option<String> {
        Tier::ALL.into_iter().find_map(|tier| {
            let path = self.root(tier).join(name).with_extension(SIDECAR_EXTENSION);
            self.sidecar_at(tier, &path)
        })
    }

    /// Make `name` the ephemeral tier's current artifact.
    ///
    /// Other artifacts in the tier are deleted first. The sidecar lands
    /// before the audio, so a visible artifact always has its text.
    pub fn write_ephemeral(&self, name: &str, audio: &[u8], text: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.ephemeral)?;
        self.sweep_ephemeral(name);

        let path = self.ephemeral.join(name);
        write_atomic(&path.with_extension(SIDECAR_EXTENSION), text.as_bytes())?;
        write_atomic(&path, audio)?;
        debug!(artifact = name, bytes = audio.len(), "Wrote ephemeral artifact");
        Ok(path)
    }

    fn sweep_ephemeral(&self, keep: &str) {
        let entries = match fs::read_dir(&self.ephemeral) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {e}", self.ephemeral.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_artifact = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension.as_str()));
            if !is_artifact || entry.file_name() == keep || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!("Swept stale artifact {}", path.display()),
                Err(e) => warn!("Failed to sweep {}: {e}", path.display()),
            }
        }
    }

    fn sidecar_at(&self, tier: Tier, path: &Path) -> Option<String> {
        if !path.exists() {
            return None;
        }
        match self.is_contained(tier, path) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    tier = tier.as_str(),
                    "Sidecar {} escapes its tier root, ignoring",
                    path.display()
                );
                return None;
            }
            Err(e) => {
                warn!("Failed to resolve sidecar {}: {e}", path.display());
                return None;
            }
        }
        match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to read sidecar {}: {e}", path.display());
                None
            }
        }
    }

    fn is_contained(&self, tier: Tier, path: &Path) -> io::Result<bool> {
        let root = fs::canonicalize(self.root(tier))?;
        let real = fs::canonicalize(path)?;
        Ok(real.starts_with(&root))
    }
}

/// Write through a temp file in the destination directory, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no file name"))?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", process::id()));
    if let Err(e) = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
