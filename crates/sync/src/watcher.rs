//! Polling watcher for the shared document.
//!
//! Network shares rarely deliver native change notifications, so the folder
//! is polled.  A change is only reported once the document has stayed
//! untouched for the quiescence window, which keeps half-finished updates of
//! slow writers out of the UI.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use explorer_config::SyncConfig;
use explorer_store::{FingerprintTracker, RetryPolicy, content_hash, is_temp_file_name, read_with_retry};

use crate::SyncError;
use crate::events::ChangeEvent;

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub quiescence: Duration,
    pub read_policy: RetryPolicy,
}

impl From<&SyncConfig> for WatchOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            quiescence: config.quiescence(),
            read_policy: RetryPolicy::new(config.read_attempts, config.read_backoff()),
        }
    }
}

/// What a watcher tells the controller.  Tagged with the generation of the
/// watcher that produced it so signals of a replaced watcher can be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherSignal {
    Changed { generation: u64, event: ChangeEvent },
    Fault { generation: u64, reason: String },
}

/// Handle to a running watcher.  Dropping it stops the watcher.
#[derive(Debug)]
pub struct DocumentWatcher {
    generation: u64,
    target: PathBuf,
    task: JoinHandle<()>,
}

impl DocumentWatcher {
    /// Start watching `target`.  `baseline_hash` is the hash of the content
    /// the UI already has; re-observing it is not a change.
    pub fn spawn(
        target: PathBuf,
        generation: u64,
        baseline_hash: Option<String>,
        options: WatchOptions,
        fingerprint: Arc<FingerprintTracker>,
        signals: mpsc::UnboundedSender<WatcherSignal>,
    ) -> Result<Self, SyncError> {
        let folder = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let target_name = target
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        // Modification times are compared in whole seconds; content hashes
        // catch rewrites within the same second.
        let config = Config::default()
            .with_poll_interval(options.poll_interval)
            .with_compare_contents(true);
        let mut poller = PollWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            config,
        )
        .map_err(|source| SyncError::Watch {
            path: folder.clone(),
            source,
        })?;
        poller
            .watch(&folder, RecursiveMode::NonRecursive)
            .map_err(|source| SyncError::Watch {
                path: folder.clone(),
                source,
            })?;

        info!(path = %target.display(), generation, "watching shared document");

        let watch_loop = WatchLoop {
            target: target.clone(),
            target_name,
            folder_label: folder.display().to_string(),
            generation,
            options,
            fingerprint,
            signals,
            last_seen: baseline_hash,
            pending_since: None,
            _poller: poller,
        };
        let task = tokio::spawn(watch_loop.run(raw_rx));

        Ok(Self {
            generation,
            target,
            task,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Stop polling.  Returns once the watcher task has ended.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        debug!(path = %self.target.display(), generation = self.generation, "watcher stopped");
    }
}

impl Drop for DocumentWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct WatchLoop {
    target: PathBuf,
    target_name: String,
    folder_label: String,
    generation: u64,
    options: WatchOptions,
    fingerprint: Arc<FingerprintTracker>,
    signals: mpsc::UnboundedSender<WatcherSignal>,
    /// Hash of the last content reported (or handed to the UI up front).
    last_seen: Option<String>,
    /// Time of the most recent modification not yet reported.
    pending_since: Option<Instant>,
    _poller: PollWatcher,
}

impl WatchLoop {
    async fn run(mut self, mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>) {
        loop {
            let deadline = self
                .pending_since
                .map(|since| since + self.options.quiescence);
            let settle = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let outcome = tokio::select! {
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => self.on_event(event).await,
                    Some(Err(err)) => Err(format!("watching the shared folder failed: {err}")),
                    None => Err("shared folder poller stopped unexpectedly".to_string()),
                },
                _ = settle => {
                    self.pending_since = None;
                    self.on_settled().await
                }
            };

            if let Err(reason) = outcome {
                warn!(path = %self.target.display(), generation = self.generation, %reason, "watcher fault");
                let _ = self.signals.send(WatcherSignal::Fault {
                    generation: self.generation,
                    reason,
                });
                break;
            }
        }
    }

    fn is_target(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if is_temp_file_name(&self.target_name, name) {
            trace!(file = name, "ignoring in-flight atomic write");
            return false;
        }
        name == self.target_name
    }

    async fn on_event(&mut self, event: Event) -> Result<(), String> {
        if !event.paths.iter().any(|path| self.is_target(path)) {
            return Ok(());
        }

        match event.kind {
            EventKind::Access(_) => Ok(()),
            EventKind::Remove(_) => match tokio::fs::metadata(&self.target).await {
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    Err("shared document was removed".to_string())
                }
                Err(err) => Err(format!("shared document is unreachable: {err}")),
                // Already replaced by another writer's rename.
                Ok(_) => {
                    self.pending_since = Some(Instant::now());
                    Ok(())
                }
            },
            _ => {
                trace!(kind = ?event.kind, "shared document touched");
                self.pending_since = Some(Instant::now());
                Ok(())
            }
        }
    }

    async fn on_settled(&mut self) -> Result<(), String> {
        let text = match read_with_retry(&self.target, self.options.read_policy).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err("shared document was removed".to_string());
            }
            Err(err) => return Err(format!("failed to read shared document: {err}")),
        };

        let hash = content_hash(&text);
        if self.last_seen.as_deref() == Some(hash.as_str()) {
            debug!(path = %self.target.display(), "content unchanged; nothing to report");
            return Ok(());
        }
        self.last_seen = Some(hash.clone());

        if self
            .fingerprint
            .is_likely_echo(&hash, chrono::Utc::now().timestamp_millis())
        {
            debug!(path = %self.target.display(), "echo of our own write; suppressed");
            return Ok(());
        }

        info!(path = %self.target.display(), bytes = text.len(), "shared document changed externally");
        self.signals
            .send(WatcherSignal::Changed {
                generation: self.generation,
                event: ChangeEvent {
                    folder_path: self.folder_label.clone(),
                    document: text,
                },
            })
            .map_err(|_| "sync controller is gone".to_string())
    }
}

#[cfg(test)]
mod tests {
    use explorer_store::write_atomic;
    use tempfile::TempDir;

    use super::*;

    fn fast_options() -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(50),
            quiescence: Duration::from_millis(150),
            read_policy: RetryPolicy::new(3, Duration::from_millis(10)),
        }
    }

    struct Harness {
        _dir: TempDir,
        target: PathBuf,
        fingerprint: Arc<FingerprintTracker>,
        rx: mpsc::UnboundedReceiver<WatcherSignal>,
        watcher: DocumentWatcher,
    }

    fn start(initial: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.json");
        std::fs::write(&target, initial).unwrap();
        let fingerprint = Arc::new(FingerprintTracker::new(Duration::from_secs(3)));
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = DocumentWatcher::spawn(
            target.clone(),
            7,
            Some(content_hash(initial)),
            fast_options(),
            fingerprint.clone(),
            tx,
        )
        .unwrap();
        Harness {
            _dir: dir,
            target,
            fingerprint,
            rx,
            watcher,
        }
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<WatcherSignal>, within: Duration) -> Option<WatcherSignal> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_external_change_once() {
        let mut h = start("[]");
        tokio::time::sleep(Duration::from_millis(120)).await;

        let policy = RetryPolicy::new(3, Duration::from_millis(5));
        write_atomic(&h.target, r#"[{"title":"B"}]"#, policy).await.unwrap();

        match next_signal(&mut h.rx, Duration::from_secs(3)).await {
            Some(WatcherSignal::Changed { generation, event }) => {
                assert_eq!(generation, 7);
                assert_eq!(event.document, r#"[{"title":"B"}]"#);
            }
            other => panic!("expected a change, got {other:?}"),
        }
        assert!(
            next_signal(&mut h.rx, Duration::from_millis(500)).await.is_none(),
            "one physical change must produce one signal"
        );
        assert_eq!(h.watcher.generation(), 7);
    }

    async fn expect_change(rx: &mut mpsc::UnboundedReceiver<WatcherSignal>, document: &str) {
        match next_signal(rx, Duration::from_secs(3)).await {
            Some(WatcherSignal::Changed { event, .. }) => assert_eq!(event.document, document),
            other => panic!("expected a change to {document}, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_rewrites_within_the_same_second() {
        let mut h = start("[]");
        tokio::time::sleep(Duration::from_millis(120)).await;
        let policy = RetryPolicy::new(3, Duration::from_millis(5));

        write_atomic(&h.target, r#"[{"title":"B"}]"#, policy).await.unwrap();
        expect_change(&mut h.rx, r#"[{"title":"B"}]"#).await;

        write_atomic(&h.target, r#"[{"title":"C"}]"#, policy).await.unwrap();
        expect_change(&mut h.rx, r#"[{"title":"C"}]"#).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suppresses_echo_of_own_write() {
        let mut h = start("[]");
        tokio::time::sleep(Duration::from_millis(120)).await;
        let policy = RetryPolicy::new(3, Duration::from_millis(5));

        // The watcher is live: an external write is reported.
        write_atomic(&h.target, r#"[{"title":"B"}]"#, policy).await.unwrap();
        expect_change(&mut h.rx, r#"[{"title":"B"}]"#).await;

        let own = r#"[{"title":"C"}]"#;
        write_atomic(&h.target, own, policy).await.unwrap();
        h.fingerprint.record(own);

        assert!(
            next_signal(&mut h.rx, Duration::from_millis(700)).await.is_none(),
            "a fingerprinted write inside the echo window must not be reported"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn own_write_seen_after_echo_window_is_reported() {
        let mut h = start("[]");
        // Shorter than the quiescence window, so the echo check runs too late.
        let fingerprint = Arc::new(FingerprintTracker::new(Duration::from_millis(50)));
        let (tx, rx) = mpsc::unbounded_channel();
        h.watcher = DocumentWatcher::spawn(
            h.target.clone(),
            8,
            Some(content_hash("[]")),
            fast_options(),
            fingerprint.clone(),
            tx,
        )
        .unwrap();
        h.rx = rx;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let own = r#"[{"title":"C"}]"#;
        write_atomic(&h.target, own, RetryPolicy::new(3, Duration::from_millis(5)))
            .await
            .unwrap();
        fingerprint.record(own);

        expect_change(&mut h.rx, own).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ignores_in_flight_temp_files() {
        let mut h = start("[]");
        tokio::time::sleep(Duration::from_millis(120)).await;

        let temp = h.target.with_file_name(".data.json.999.1-0.tmp");
        std::fs::write(&temp, "[{\"title\":\"half").unwrap();

        assert!(next_signal(&mut h.rx, Duration::from_millis(600)).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removal_is_a_fault() {
        let mut h = start("[]");
        tokio::time::sleep(Duration::from_millis(120)).await;

        std::fs::remove_file(&h.target).unwrap();

        match next_signal(&mut h.rx, Duration::from_secs(3)).await {
            Some(WatcherSignal::Fault { generation, reason }) => {
                assert_eq!(generation, 7);
                assert!(reason.contains("removed"), "{reason}");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_watcher_is_silent() {
        let Harness {
            _dir,
            target,
            mut rx,
            watcher,
            ..
        } = start("[]");
        watcher.stop().await;

        std::fs::write(&target, r#"[{"title":"late"}]"#).unwrap();
        assert!(next_signal(&mut rx, Duration::from_millis(500)).await.is_none());
    }
}
