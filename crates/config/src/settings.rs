//! Persisted sync mode.
//!
//! The settings file is the only durable state outside the catalog document
//! itself.  It lives in the per-user data directory, never in the shared
//! folder, so every collaborator keeps their own mode.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SETTINGS_FILE_NAME: &str = "server-sync.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    #[serde(rename = "serverSyncEnabled")]
    pub enabled: bool,
    /// Folder holding the shared `data.json`.  Kept after sync is disabled so
    /// the UI can still show where sync used to point.
    #[serde(rename = "serverSyncFolderPath")]
    pub folder_path: String,
}

impl SyncSettings {
    pub fn folder(&self) -> Option<PathBuf> {
        let raw = self.folder_path.trim();
        if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    }
}

/// Fields to override on save.  `None` keeps the last persisted value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub folder_path: Option<String>,
}

impl SettingsPatch {
    pub fn enable(folder: impl AsRef<Path>) -> Self {
        Self {
            enabled: Some(true),
            folder_path: Some(folder.as_ref().display().to_string()),
        }
    }

    pub fn disable() -> Self {
        Self {
            enabled: Some(false),
            folder_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted settings.  Never fails: a missing, unreadable or
    /// malformed file yields the defaults.
    pub fn load(&self) -> SyncSettings {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return SyncSettings::default(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "settings unreadable; using defaults");
                return SyncSettings::default();
            }
        };

        let mut settings = match serde_json::from_str::<SyncSettings>(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "settings malformed; using defaults");
                return SyncSettings::default();
            }
        };

        if settings.enabled && settings.folder().is_none() {
            warn!(path = %self.path.display(), "sync enabled without a folder path; treating as disabled");
            settings.enabled = false;
        }
        settings
    }

    /// Merge `patch` over the currently persisted settings and write the
    /// result.  Returns exactly what was persisted.
    pub fn save(&self, patch: &SettingsPatch) -> Result<SyncSettings> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating settings directory {}", parent.display()))?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.sidecar("lock"))
            .context("opening settings lock")?;
        lock_file.lock_exclusive().context("locking settings")?;

        let result = self.merge_and_write(patch);
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn merge_and_write(&self, patch: &SettingsPatch) -> Result<SyncSettings> {
        // Always start from what is on disk, never from a cached copy.
        let mut merged = self.load();
        if let Some(enabled) = patch.enabled {
            merged.enabled = enabled;
        }
        if let Some(folder_path) = &patch.folder_path {
            merged.folder_path = folder_path.trim().to_string();
        }

        if merged.enabled && merged.folder().is_none() {
            bail!("sync cannot be enabled without a folder path");
        }

        let rendered = serde_json::to_string_pretty(&merged)?;
        let tmp_path = self.sidecar("tmp");
        fs::write(&tmp_path, rendered)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("replacing {}", self.path.display()));
        }

        debug!(enabled = merged.enabled, folder = %merged.folder_path, "sync settings saved");
        Ok(merged)
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| SETTINGS_FILE_NAME.to_string());
        self.path.with_file_name(format!("{filename}.{suffix}"))
    }
}
