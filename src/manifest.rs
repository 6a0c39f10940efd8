use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::discovery::{Manifest, RepositoryRecord};

/// Per-account manifest files under the repositories root
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<account>.json`
    pub fn path_for(&self, account: &str) -> PathBuf {
        self.root.join(format!("{}.json", account))
    }

    /// Replace the account's manifest with `manifest`, pretty-printed
    pub fn save(&self, account: &str, manifest: &[RepositoryRecord]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create directory: {}", self.root.display()))?;

        let path = self.path_for(account);
        let content =
            serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;

        // Write beside the target and rename so a crash never leaves half a manifest
        let staging = self.root.join(format!(".{}.json.tmp", account));
        fs::write(&staging, content)
            .with_context(|| format!("Failed to write manifest: {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to replace manifest: {}", path.display()))?;

        debug!("Saved {} records to {}", manifest.len(), path.display());
        Ok(path)
    }

    /// Read a manifest written by [`save`](Self::save)
    pub fn load(&self, account: &str) -> Result<Manifest> {
        let path = self.path_for(account);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }
}
