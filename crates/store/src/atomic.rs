//! Crash-safe whole-file replacement for documents that other processes read
//! concurrently, possibly over a network share.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

/// Distinguishes temp files staged by the same process within one millisecond.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Bounded linear backoff: attempt `n` waits `backoff * n` before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    fn bounded_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to stage {}: {source}", path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace {} after {attempts} attempt(s): {source}", path.display())]
    Replace {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Returns `true` when `candidate` is a staging file of [`write_atomic`] for
/// a document named `target_name`, from any process.
pub fn is_temp_file_name(target_name: &str, candidate: &str) -> bool {
    candidate.len() > target_name.len() + 2
        && candidate.starts_with('.')
        && candidate[1..].starts_with(target_name)
        && candidate[1 + target_name.len()..].starts_with('.')
        && candidate.ends_with(TEMP_SUFFIX)
}

fn temp_file_name(target_name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        ".{target_name}.{}.{millis}-{seq}{TEMP_SUFFIX}",
        std::process::id()
    )
}

/// Rename failures worth retrying: the target is briefly held open by a
/// scanner, a sync client or another reader.
pub(crate) fn is_retryable(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::AlreadyExists | ErrorKind::ResourceBusy
    ) {
        return true;
    }

    #[cfg(unix)]
    const BUSY_CODES: &[i32] = &[16, 26]; // EBUSY, ETXTBSY
    #[cfg(windows)]
    const BUSY_CODES: &[i32] = &[5, 32, 33, 183]; // access denied, sharing/lock violation, already exists
    #[cfg(not(any(unix, windows)))]
    const BUSY_CODES: &[i32] = &[];

    err.raw_os_error()
        .map(|code| BUSY_CODES.contains(&code))
        .unwrap_or(false)
}

/// Replace `path` with `text` so that readers observe either the previous
/// complete content or the new complete content.
///
/// The text is staged in a sibling temp file, flushed and `fsync`'d, then
/// renamed over the target.  A crash before the rename leaves the target
/// untouched.  Retryable rename failures back off linearly; on exhaustion the
/// temp file is removed and the error surfaced.
///
/// The parent directory must already exist.  A vanished shared folder fails
/// the write instead of being silently re-created.
pub async fn write_atomic(path: &Path, text: &str, policy: RetryPolicy) -> Result<(), WriteError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let target_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let tmp_path = parent.join(temp_file_name(&target_name));

    let stage_result: io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        // Flush userspace buffers and sync to disk before rename.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(source) = stage_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(WriteError::Stage {
            path: path.to_path_buf(),
            source,
        });
    }

    let attempts = policy.bounded_attempts();
    let mut attempt = 1;
    loop {
        match tokio::fs::rename(&tmp_path, path).await {
            Ok(()) => {
                debug!(path = %path.display(), bytes = text.len(), attempt, "document replaced");
                return Ok(());
            }
            Err(err) if attempt < attempts && is_retryable(&err) => {
                warn!(path = %path.display(), attempt, error = %err, "rename blocked; retrying");
                if err.kind() == ErrorKind::AlreadyExists {
                    let _ = tokio::fs::remove_file(path).await;
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(source) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(WriteError::Replace {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

/// Read `path` as UTF-8, retrying with linear backoff.  Tolerates the brief
/// window in which another writer's rename makes the file unreadable.
pub async fn read_with_retry(path: &Path, policy: RetryPolicy) -> io::Result<String> {
    let attempts = policy.bounded_attempts();
    let mut attempt = 1;
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => return Ok(text),
            Err(err) if attempt < attempts => {
                debug!(path = %path.display(), attempt, error = %err, "read failed; retrying");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
