//! Project metadata collaborator.
//!
//! The managers never read project files themselves; they go through
//! [`ProjectStore`], an opaque lookup for working directories and
//! runnable script names. The shipped implementation is backed by a
//! `package.json` manifest.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::SessionError;

/// Narrow interface to project metadata.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Resolve a project identifier to an absolute working directory.
    async fn resolve_working_dir(&self, identifier: &str) -> Result<PathBuf, SessionError>;

    /// Script names runnable in the project at `path`.
    async fn list_scripts(&self, path: &Path) -> Result<Vec<String>, SessionError>;
}

/// `package.json`-backed project store. Project identifiers are either
/// absolute paths or directories under a configured root.
pub struct PackageManifestStore {
    root: PathBuf,
}

impl PackageManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProjectStore for PackageManifestStore {
    async fn resolve_working_dir(&self, identifier: &str) -> Result<PathBuf, SessionError> {
        let candidate = Path::new(identifier);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            _ => Err(SessionError::WorkingDirectory(identifier.to_string())),
        }
    }

    async fn list_scripts(&self, path: &Path) -> Result<Vec<String>, SessionError> {
        let manifest = path.join("package.json");
        let raw = match tokio::fs::read_to_string(&manifest).await {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(path = %manifest.display(), "no manifest found");
                return Ok(Vec::new());
            }
        };
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Manifest(format!("{}: {e}", manifest.display())))?;
        let mut scripts: Vec<String> = value
            .get("scripts")
            .and_then(|s| s.as_object())
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        scripts.sort();
        Ok(scripts)
    }
}
