use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the storage tree. Changing it means tearing down and
    /// re-initializing the whole stack against the new location.
    pub root_dir: PathBuf,
    /// How long a mutated record waits before its write fires, so rapid
    /// edits coalesce into one write
    pub debounce_ms: u64,
    /// Whether the filesystem watcher runs at all
    pub watcher_enabled: bool,
    /// How long after our own write a filesystem event on that path is
    /// treated as an echo rather than an external edit
    pub watch_suppression_ms: u64,
    /// Idle days before a project board auto-hides, for boards without
    /// their own threshold
    pub default_auto_hide_days: u32,
}

impl StoreConfig {
    /// Config rooted at the platform data directory.
    pub fn new() -> Self {
        Self::at(default_root())
    }

    pub fn at(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            debounce_ms: 500,
            watcher_enabled: true,
            watch_suppression_ms: 2_000,
            default_auto_hide_days: 14,
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn watch_suppression(&self) -> Duration {
        Duration::from_millis(self.watch_suppression_ms)
    }

    /// Read a saved config, falling back to defaults when the file does
    /// not exist. Missing fields fill in from defaults, so old files keep
    /// working after new fields appear.
    pub fn load(path: &Path) -> StoreResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, format!("{raw}\n"))?;
        Ok(())
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(StoreError::Validation("root_dir must not be empty".into()));
        }
        if self.debounce_ms == 0 {
            return Err(StoreError::Validation(
                "debounce_ms must be at least 1".into(),
            ));
        }
        if self.default_auto_hide_days == 0 {
            return Err(StoreError::Validation(
                "default_auto_hide_days must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskdeck")
}
