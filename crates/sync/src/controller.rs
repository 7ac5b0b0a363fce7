//! The sync controller: owns the mode, the watcher and every transition
//! between local-only and shared-folder operation.
//!
//! All transitions and all document reads and writes go through one async
//! mutex, so enable, disable and fault handling never interleave and writes
//! land in issue order.  Background failures never surface as errors; they
//! always resolve into the fault transition plus an `error` status event.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use explorer_config::{AppConfig, DOCUMENT_FILE_NAME, SettingsPatch, SettingsStore, SyncConfig, SyncSettings};
use explorer_store::{
    Document, FingerprintTracker, RetryPolicy, WriteError, content_hash, read_with_retry, write_atomic,
};

use crate::commands::{DisableOptions, DisableOutcome, EnableOutcome, SyncMode, SyncTarget};
use crate::events::{StatusKind, SyncEvent};
use crate::picker::FolderPicker;
use crate::watcher::{DocumentWatcher, WatchOptions, WatcherSignal};
use crate::SyncError;

/// Broadcast channel capacity. Old events are dropped when subscribers lag.
const BROADCAST_CAP: usize = 256;

struct ControllerState {
    mode: SyncMode,
    /// Shared folder while `Remote`.
    folder: Option<PathBuf>,
    watcher: Option<DocumentWatcher>,
    /// Generation of the most recently started watcher.
    latest_generation: u64,
    /// Highest generation whose fault has been handled.
    faulted_generation: u64,
}

pub struct SyncController {
    sync: SyncConfig,
    local_path: PathBuf,
    bundled_path: Option<PathBuf>,
    settings: SettingsStore,
    picker: Arc<dyn FolderPicker>,
    fingerprint: Arc<FingerprintTracker>,
    events: broadcast::Sender<SyncEvent>,
    signal_tx: mpsc::UnboundedSender<WatcherSignal>,
    state: Mutex<ControllerState>,
}

impl SyncController {
    /// Build a controller in `Local` mode.  Call [`subscribe`] first and then
    /// [`initialize`] to resume a persisted shared-folder session.
    ///
    /// Must be called inside a tokio runtime: watcher signals are drained by a
    /// background task.
    ///
    /// [`subscribe`]: Self::subscribe
    /// [`initialize`]: Self::initialize
    pub fn new(config: &AppConfig, picker: Arc<dyn FolderPicker>) -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(Self {
            sync: config.sync.clone(),
            local_path: config.local_document_path(),
            bundled_path: config.bundled_document_path(),
            settings: SettingsStore::new(config.settings_path()),
            picker,
            fingerprint: Arc::new(FingerprintTracker::new(config.sync.echo_window())),
            events,
            signal_tx,
            state: Mutex::new(ControllerState {
                mode: SyncMode::Local,
                folder: None,
                watcher: None,
                latest_generation: 0,
                faulted_generation: 0,
            }),
        });

        tokio::spawn(pump_signals(Arc::downgrade(&controller), signal_rx));
        controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn get_sync_settings(&self) -> SyncSettings {
        self.settings.load()
    }

    pub async fn mode(&self) -> SyncMode {
        self.state.lock().await.mode
    }

    pub fn fingerprint(&self) -> &FingerprintTracker {
        &self.fingerprint
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.sync.write_attempts, self.sync.write_backoff())
    }

    fn read_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.sync.read_attempts, self.sync.read_backoff())
    }

    fn broadcast(&self, event: SyncEvent) {
        // No subscribers is fine: events are fire-and-forget.
        let _ = self.events.send(event);
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Derive the mode from persisted settings.  A persisted shared folder
    /// whose document cannot be reached (after one reconnect probe) is
    /// abandoned with an `error` status.
    pub async fn initialize(&self) -> Result<SyncMode, SyncError> {
        let mut state = self.state.lock().await;
        if state.watcher.is_some() {
            return Ok(state.mode);
        }

        let settings = self.settings.load();
        let Some(folder) = settings.folder().filter(|_| settings.enabled) else {
            state.mode = SyncMode::Local;
            return Ok(SyncMode::Local);
        };
        let external = folder.join(DOCUMENT_FILE_NAME);

        if !is_reachable(&external).await {
            info!(path = %external.display(), "shared document unreachable; probing once more");
            tokio::time::sleep(self.sync.reconnect_delay()).await;
            if !is_reachable(&external).await {
                let reason = format!("Shared document {} is not reachable", external.display());
                self.fault_locked(&mut state, &reason).await;
                return Ok(SyncMode::Local);
            }
        }

        let baseline = read_with_retry(&external, self.read_policy())
            .await
            .ok()
            .map(|text| content_hash(&text));
        if let Err(err) = self.start_watcher(&mut state, &folder, baseline) {
            self.fault_locked(&mut state, &err.to_string()).await;
            return Ok(SyncMode::Local);
        }

        info!(folder = %folder.display(), "shared-folder sync resumed");
        self.broadcast(SyncEvent::status(
            StatusKind::Enabled,
            true,
            &settings.folder_path,
            format!("Sync resumed: {}", folder.display()),
        ));
        Ok(state.mode)
    }

    // ── Enable ────────────────────────────────────────────────────────────────

    /// Switch to shared-folder mode.  `seed` becomes the shared document only
    /// if the chosen folder does not have one yet.
    pub async fn enable_sync(&self, seed: &Document) -> Result<EnableOutcome, SyncError> {
        let mut state = self.state.lock().await;
        let current = self.settings.load();

        let Some(folder) = self.picker.pick_folder(current.folder().as_deref()).await else {
            info!("enabling sync cancelled");
            return Ok(EnableOutcome {
                enabled: state.mode == SyncMode::Remote,
                cancelled: true,
                folder_path: current.folder_path,
                document: None,
            });
        };

        verify_directory(&folder).await?;
        verify_writable(&folder).await?;

        let external = folder.join(DOCUMENT_FILE_NAME);
        let document = match tokio::fs::try_exists(&external).await {
            Ok(true) => read_with_retry(&external, self.read_policy())
                .await
                .map_err(|source| SyncError::Read {
                    path: external.clone(),
                    source,
                })?,
            Ok(false) => {
                let text = seed.to_json_pretty()?;
                write_atomic(&external, &text, self.write_policy()).await?;
                self.fingerprint.record(&text);
                info!(path = %external.display(), records = seed.len(), "seeded shared document");
                text
            }
            Err(source) => {
                return Err(SyncError::Read {
                    path: external,
                    source,
                });
            }
        };

        let saved = self.settings.save(&SettingsPatch::enable(&folder))?;

        if let Some(previous) = state.watcher.take() {
            debug!(path = %previous.target().display(), "re-targeting shared folder");
            previous.stop().await;
        }
        if let Err(err) = self.start_watcher(&mut state, &folder, Some(content_hash(&document))) {
            self.fault_locked(&mut state, &err.to_string()).await;
            return Err(err);
        }

        info!(folder = %folder.display(), "shared-folder sync enabled");
        self.broadcast(SyncEvent::status(
            StatusKind::Enabled,
            true,
            &saved.folder_path,
            format!("Sync enabled: {}", folder.display()),
        ));

        Ok(EnableOutcome {
            enabled: true,
            cancelled: false,
            folder_path: saved.folder_path,
            document: Some(document),
        })
    }

    fn start_watcher(
        &self,
        state: &mut ControllerState,
        folder: &Path,
        baseline_hash: Option<String>,
    ) -> Result<(), SyncError> {
        let generation = state.latest_generation + 1;
        let watcher = DocumentWatcher::spawn(
            folder.join(DOCUMENT_FILE_NAME),
            generation,
            baseline_hash,
            WatchOptions::from(&self.sync),
            self.fingerprint.clone(),
            self.signal_tx.clone(),
        )?;
        state.latest_generation = generation;
        state.watcher = Some(watcher);
        state.folder = Some(folder.to_path_buf());
        state.mode = SyncMode::Remote;
        Ok(())
    }

    // ── Disable ───────────────────────────────────────────────────────────────

    /// Switch back to local-only mode at the user's request.
    pub async fn disable_sync(&self, options: DisableOptions) -> Result<DisableOutcome, SyncError> {
        let mut state = self.state.lock().await;
        let was_remote = state.mode == SyncMode::Remote;

        if let Some(watcher) = state.watcher.take() {
            watcher.stop().await;
        }
        state.mode = SyncMode::Disabling;
        self.fingerprint.clear();

        let folder = state.folder.take();
        if let (true, true, Some(folder)) = (was_remote, options.copy_to_local, folder.as_ref()) {
            self.copy_external_to_local(folder).await;
        }

        let saved = self.settings.save(&SettingsPatch::disable());
        state.mode = SyncMode::Local;
        let saved = saved?;

        info!(folder = %saved.folder_path, "shared-folder sync disabled");
        self.broadcast(SyncEvent::status(
            StatusKind::Disabled,
            false,
            &saved.folder_path,
            "Sync disabled",
        ));

        let document = match self.read_local().await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "local document unavailable after disabling sync");
                None
            }
        };

        Ok(DisableOutcome {
            enabled: false,
            folder_path: saved.folder_path,
            document,
        })
    }

    /// Best-effort: failures are logged and swallowed.
    async fn copy_external_to_local(&self, folder: &Path) {
        let external = folder.join(DOCUMENT_FILE_NAME);
        let text = match read_with_retry(&external, self.read_policy()).await {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %external.display(), error = %err, "could not copy shared document back; keeping local copy");
                return;
            }
        };
        match self.write_local(&text).await {
            Ok(()) => info!(path = %self.local_path.display(), "shared document copied to local"),
            Err(err) => warn!(error = %err, "could not write local copy of shared document"),
        }
    }

    // ── Faults ────────────────────────────────────────────────────────────────

    async fn handle_signal(&self, signal: WatcherSignal) {
        let mut state = self.state.lock().await;
        match signal {
            WatcherSignal::Changed { generation, event } => {
                let current = state.watcher.as_ref().map(DocumentWatcher::generation);
                if state.mode == SyncMode::Remote && current == Some(generation) {
                    self.broadcast(SyncEvent::DocumentChanged(event));
                } else {
                    debug!(generation, "dropping change from a stopped watcher");
                }
            }
            WatcherSignal::Fault { generation, reason } => {
                if generation != state.latest_generation || generation <= state.faulted_generation {
                    debug!(generation, %reason, "fault already handled or superseded");
                    return;
                }
                self.fault_locked(&mut state, &reason).await;
            }
        }
    }

    /// `Remote → Disabling → Local`.  Marks the current watcher generation as
    /// handled so that duplicate signals collapse into this one transition.
    async fn fault_locked(&self, state: &mut ControllerState, reason: &str) {
        state.faulted_generation = state.latest_generation;
        state.mode = SyncMode::Disabling;
        if let Some(watcher) = state.watcher.take() {
            watcher.stop().await;
        }
        state.folder = None;
        self.fingerprint.clear();

        // Only the flag changes; the folder path stays for the UI.
        let folder_path = match self.settings.save(&SettingsPatch::disable()) {
            Ok(saved) => saved.folder_path,
            Err(err) => {
                error!(error = %err, "failed to persist sync shutdown");
                self.settings.load().folder_path
            }
        };
        state.mode = SyncMode::Local;

        warn!(%reason, folder = %folder_path, "sync fault; reverted to local mode");
        self.broadcast(SyncEvent::status(
            StatusKind::Error,
            false,
            &folder_path,
            format!("Sync disabled: {reason}"),
        ));
    }

    // ── Document path ─────────────────────────────────────────────────────────

    /// Current document text from the active target.  A shared document that
    /// stays unreadable triggers the fault transition and the local copy is
    /// returned instead.
    pub async fn read_document(&self) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;
        if let (SyncMode::Remote, Some(folder)) = (state.mode, state.folder.clone()) {
            let external = folder.join(DOCUMENT_FILE_NAME);
            match read_with_retry(&external, self.read_policy()).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let reason = format!("failed to read shared document: {err}");
                    self.fault_locked(&mut state, &reason).await;
                }
            }
        }
        self.read_local().await
    }

    /// [`read_document`](Self::read_document) parsed leniently, with stored
    /// paths normalized.  A document that needed normalizing is written back;
    /// failing to do so is only logged.
    pub async fn load_document(&self) -> Result<Document, SyncError> {
        let text = self.read_document().await?;
        let mut document = Document::parse_lenient(&text)?;
        if document.normalize_paths() {
            match self.write_document(&document).await {
                Ok(target) => info!(?target, records = document.len(), "stored paths normalized"),
                Err(err) => warn!(error = %err, "could not save normalized paths"),
            }
        }
        Ok(document)
    }

    /// The per-user data directory is ours to create.  Shared folders never
    /// are: see [`write_atomic`].
    async fn write_local(&self, text: &str) -> Result<(), SyncError> {
        if let Some(parent) = self.local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| WriteError::Stage {
                    path: self.local_path.clone(),
                    source,
                })?;
        }
        write_atomic(&self.local_path, text, self.write_policy()).await?;
        Ok(())
    }

    async fn read_local(&self) -> Result<String, SyncError> {
        match tokio::fs::read_to_string(&self.local_path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let Some(bundled) = &self.bundled_path else {
                    return Err(SyncError::DocumentMissing(self.local_path.clone()));
                };
                let text = tokio::fs::read_to_string(bundled)
                    .await
                    .map_err(|source| SyncError::Read {
                        path: bundled.clone(),
                        source,
                    })?;
                self.write_local(&text).await?;
                info!(from = %bundled.display(), to = %self.local_path.display(), "materialized bundled document");
                Ok(text)
            }
            Err(source) => Err(SyncError::Read {
                path: self.local_path.clone(),
                source,
            }),
        }
    }

    /// Replace the document at the active target.  A shared write that fails
    /// after retries triggers the fault transition and the document is
    /// written locally instead, so nothing is lost.
    pub async fn write_document(&self, document: &Document) -> Result<SyncTarget, SyncError> {
        let text = document.to_json_pretty()?;
        let mut state = self.state.lock().await;

        if let (SyncMode::Remote, Some(folder)) = (state.mode, state.folder.clone()) {
            let external = folder.join(DOCUMENT_FILE_NAME);
            match write_atomic(&external, &text, self.write_policy()).await {
                Ok(()) => {
                    self.fingerprint.record(&text);
                    debug!(records = document.len(), "document written to shared folder");
                    return Ok(SyncTarget::External);
                }
                Err(err) => {
                    let reason = format!("failed to write shared document: {err}");
                    self.fault_locked(&mut state, &reason).await;
                }
            }
        }

        self.write_local(&text).await?;
        debug!(records = document.len(), "document written locally");
        Ok(SyncTarget::Local)
    }

    /// Entry point for untyped input: rejects anything but an array of
    /// objects before writing.
    pub async fn write_document_json(&self, value: Value) -> Result<SyncTarget, SyncError> {
        let document = Document::from_value(value)?;
        self.write_document(&document).await
    }

    /// Write `document` to an arbitrary file, e.g. a backup.
    pub async fn export_document(&self, document: &Document, path: &Path) -> Result<(), SyncError> {
        let text = document.to_json_pretty()?;
        write_atomic(path, &text, self.write_policy()).await?;
        info!(path = %path.display(), records = document.len(), "document exported");
        Ok(())
    }

    /// Replace the document with the contents of an arbitrary file.  Stored
    /// paths are normalized on the way in.
    pub async fn import_document(&self, path: &Path) -> Result<Document, SyncError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SyncError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut document = Document::parse_lenient(&text)?;
        document.normalize_paths();
        let target = self.write_document(&document).await?;
        info!(path = %path.display(), records = document.len(), ?target, "document imported");
        Ok(document)
    }
}

async fn pump_signals(controller: Weak<SyncController>, mut rx: mpsc::UnboundedReceiver<WatcherSignal>) {
    while let Some(signal) = rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_signal(signal).await;
    }
}

async fn is_reachable(external: &Path) -> bool {
    tokio::fs::metadata(external)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn verify_directory(folder: &Path) -> Result<(), SyncError> {
    match tokio::fs::metadata(folder).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(SyncError::NotADirectory(folder.to_path_buf())),
    }
}

/// Write and delete a uniquely named probe file.  The probe never outlives
/// this call.
async fn verify_writable(folder: &Path) -> Result<(), SyncError> {
    let probe = folder.join(format!(
        ".explorer-probe-{}-{}.tmp",
        std::process::id(),
        Uuid::new_v4().simple()
    ));

    if let Err(source) = tokio::fs::write(&probe, b"probe").await {
        let _ = tokio::fs::remove_file(&probe).await;
        return Err(SyncError::PermissionDenied {
            path: folder.to_path_buf(),
            source,
        });
    }
    tokio::fs::remove_file(&probe)
        .await
        .map_err(|source| SyncError::PermissionDenied {
            path: folder.to_path_buf(),
            source,
        })
}
