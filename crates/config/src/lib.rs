mod settings;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use settings::{SETTINGS_FILE_NAME, SettingsPatch, SettingsStore, SyncSettings};

/// File name of the catalog document, identical at the local and the shared
/// target.
pub const DOCUMENT_FILE_NAME: &str = "data.json";

// ── Paths ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-user application directory.  Holds the settings file, the local
    /// document copy and the log directory.  Overridden at runtime by the
    /// `EXPLORER_DATA_DIR` environment variable when set.
    pub data_dir: String,
    /// Seed document shipped with the application.  Copied to the local
    /// target the first time it is read and found missing.  Empty disables
    /// seeding.
    pub bundled_document: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: ".explorer".to_string(),
            bundled_document: String::new(),
        }
    }
}

// ── Sync tuning ───────────────────────────────────────────────────────────────

/// Timing and retry constants of the shared-folder sync.  None of these are
/// part of the on-disk contract; they only shape how patient the sync is with
/// slow or busy shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the shared folder is polled for changes.
    pub poll_interval_ms: u64,
    /// How long the shared document must stay untouched before a change is
    /// considered complete.
    pub quiescence_ms: u64,
    /// A change whose content hash matches our own last write within this
    /// window is treated as an echo and dropped.
    pub echo_window_ms: u64,
    /// Rename attempts of the atomic writer before giving up.
    pub write_attempts: u32,
    /// Base delay of the writer's linear backoff.
    pub write_backoff_ms: u64,
    /// Read attempts against the shared document before escalating.
    pub read_attempts: u32,
    /// Base delay of the reader's linear backoff.
    pub read_backoff_ms: u64,
    /// Delay before the single reconnect probe at startup.
    pub reconnect_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            quiescence_ms: 1500,
            echo_window_ms: 5000,
            write_attempts: 6,
            write_backoff_ms: 100,
            read_attempts: 3,
            read_backoff_ms: 150,
            reconnect_delay_ms: 1000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("EXPLORER_DATA_DIR") {
            if !value.trim().is_empty() {
                config.paths.data_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_dir)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn local_document_path(&self) -> PathBuf {
        self.data_dir().join(DOCUMENT_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn bundled_document_path(&self) -> Option<PathBuf> {
        let raw = self.paths.bundled_document.trim();
        if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn sync_defaults_match_documented_constants() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.quiescence(), Duration::from_millis(1500));
        assert_eq!(cfg.write_attempts, 6, "writer must retry six times");
        assert_eq!(cfg.read_attempts, 3, "reader must retry three times");
        assert!(
            cfg.echo_window() > cfg.quiescence() + cfg.poll_interval(),
            "echo window must outlive the watcher's settle delay"
        );
    }

    #[test]
    fn path_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.paths.data_dir, ".explorer");
        assert_eq!(cfg.settings_path(), Path::new(".explorer").join("server-sync.json"));
        assert_eq!(cfg.local_document_path(), Path::new(".explorer").join("data.json"));
        assert!(cfg.bundled_document_path().is_none());
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.sync.poll_interval_ms, 500);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[sync]
quiescence_ms = 250

[paths]
bundled_document = "assets/data.json"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.sync.quiescence_ms, 250);
        assert_eq!(cfg.sync.poll_interval_ms, 500);
        assert_eq!(
            cfg.bundled_document_path(),
            Some(PathBuf::from("assets/data.json"))
        );
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/config.toml");

        let mut cfg = AppConfig::default();
        cfg.sync.echo_window_ms = 9000;
        cfg.telemetry.log_level = "debug".to_string();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.sync.echo_window_ms, 9000);
        assert_eq!(loaded.telemetry.log_level, "debug");
    }

    #[test]
    fn env_data_dir_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[paths]
data_dir = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("EXPLORER_DATA_DIR", "/tmp/from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.paths.data_dir, "/tmp/from-env");
        unsafe { env::remove_var("EXPLORER_DATA_DIR") };
    }
}
