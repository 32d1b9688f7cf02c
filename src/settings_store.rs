//! Durable experiment settings.
//!
//! The settings record is a `bincode` encoding of any `serde` value, in practice the
//! [`ExperimentConfig`]. Writes go to a sibling temp file that is renamed over the
//! target, so a failed save never leaves a half-written record behind.
//!
//! Both directions are best-effort. [`SettingsStore::save`] logs and reports `false` on
//! failure, [`SettingsStore::load`] returns `None` for a missing or unreadable record and
//! the caller falls back to defaults. The `try_*` variants expose the underlying error.
//!
//! [`export_text`] writes the `name : value` audit file. It is never read back.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::experiment::ExperimentConfig;

/// Binary settings record at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves `value`, logging a warning on failure. Returns whether the save succeeded.
    pub async fn save<T: Serialize>(&self, value: &T) -> bool {
        match self.try_save(value).await {
            Ok(()) => {
                debug!("Saved settings to {}", self.path.display());
                true
            }
            Err(e) => {
                warn!("Could not save settings to {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Saves `value`, replacing the previous record atomically.
    pub async fn try_save<T: Serialize>(&self, value: &T) -> AppResult<()> {
        let bytes = bincode::serialize(value)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.tmp_path();
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Loads the record, or `None` if it is missing or unreadable.
    pub async fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match self.try_load().await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                info!(
                    "No saved settings at {}, using defaults",
                    self.path.display()
                );
                None
            }
            Err(e) => {
                warn!(
                    "Could not load settings from {}: {}. Using defaults",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Loads the record. A missing file is `Ok(None)`, not an error.
    pub async fn try_load<T: DeserializeOwned>(&self) -> AppResult<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Writes the `name : value` export of `config`. Failures are logged, never returned.
pub async fn export_text(path: &Path, config: &ExperimentConfig) -> bool {
    let mut text = config.export_lines().join("\n");
    text.push('\n');
    match tokio::fs::write(path, text).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not export settings to {}: {}", path.display(), e);
            false
        }
    }
}
