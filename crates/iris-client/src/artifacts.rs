//! Audio artifact cache.
//!
//! Decoded attachments live under one root directory, keyed by a relative
//! path derived from the reply. A path that already exists is never
//! rewritten.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use iris_core::decode_binary;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::ClientError;

/// Components of a server-side path kept in the local derived path.
const SERVER_PATH_DEPTH: usize = 4;

pub struct ArtifactCache {
    root: PathBuf,
    writes: AtomicU64,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files actually written since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn ensure_root(&self) -> Result<(), ClientError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Last four components of the path the service advertised for the
    /// audio, e.g. `/tts/en-us/female/abc.wav` -> `tts/en-us/female/abc.wav`.
    pub fn derive_path(server_path: &str) -> Option<PathBuf> {
        let parts: Vec<&str> = server_path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() || parts.iter().any(|p| *p == ".." || *p == ".") {
            return None;
        }
        let start = parts.len().saturating_sub(SERVER_PATH_DEPTH);
        Some(parts[start..].iter().collect())
    }

    /// Content-addressed path for audio without a server path.
    pub fn fallback_path(lang: &str, gender: &str, sentence: &str) -> PathBuf {
        let digest = Sha256::digest(sentence.as_bytes());
        PathBuf::from(sanitize(lang))
            .join(sanitize(gender))
            .join(format!("{digest:x}.wav"))
    }

    /// Decode `payload` to `derived` under the cache root unless that file
    /// already exists. Returns the local path either way.
    pub fn materialize(&self, payload: &str, derived: &Path) -> Result<PathBuf, ClientError> {
        if derived.as_os_str().is_empty()
            || derived
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ClientError::Artifact(format!(
                "refusing artifact path {}",
                derived.display()
            )));
        }
        let local = self.root.join(derived);
        if local.exists() {
            debug!(path = %local.display(), "artifact already cached");
            return Ok(local);
        }
        let bytes = decode_binary(payload)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&local) {
            Ok(mut file) => {
                file.write_all(&bytes)?;
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %local.display(), bytes = bytes.len(), "artifact written");
                Ok(local)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(local),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every cached artifact.
    pub fn clear(&self) -> Result<(), ClientError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.root)?;
        info!(root = %self.root.display(), "audio cache cleared");
        Ok(())
    }
}

fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else {
        cleaned
    }
}
