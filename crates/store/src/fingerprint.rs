use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the exact document bytes.
pub fn content_hash(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(text.as_bytes());
    format!("{:x}", h.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub written_at_millis: i64,
}

/// Remembers the last document this process wrote to the shared target, so
/// the watcher can tell our own writes from a collaborator's.
///
/// In-memory only: a restarted process has no fingerprint and treats every
/// observed change as external.
#[derive(Debug)]
pub struct FingerprintTracker {
    last: Mutex<Option<Fingerprint>>,
    window_millis: i64,
}

impl FingerprintTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            window_millis: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn record(&self, text: &str) -> Fingerprint {
        self.record_at(text, Utc::now().timestamp_millis())
    }

    pub fn record_at(&self, text: &str, now_millis: i64) -> Fingerprint {
        let fingerprint = Fingerprint {
            hash: content_hash(text),
            written_at_millis: now_millis,
        };
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(fingerprint.clone());
        fingerprint
    }

    pub fn last(&self) -> Option<Fingerprint> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` iff `hash` matches our last write and `now_millis` falls inside
    /// `[written_at, written_at + window)`.
    pub fn is_likely_echo(&self, hash: &str, now_millis: i64) -> bool {
        let guard = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(last) = guard.as_ref() else {
            return false;
        };
        let elapsed = now_millis.saturating_sub(last.written_at_millis);
        last.hash == hash && (0..self.window_millis).contains(&elapsed)
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(5000);

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash("[]"), content_hash("[ ]"));
    }

    #[test]
    fn no_write_means_no_echo() {
        let tracker = FingerprintTracker::new(WINDOW);
        assert!(!tracker.is_likely_echo(&content_hash("[]"), 0));
        assert!(tracker.last().is_none());
    }

    #[test]
    fn same_hash_inside_window_is_echo() {
        let tracker = FingerprintTracker::new(WINDOW);
        let fp = tracker.record_at("[]", 10_000);
        assert!(tracker.is_likely_echo(&fp.hash, 10_000));
        assert!(tracker.is_likely_echo(&fp.hash, 14_999));
    }

    #[test]
    fn window_edge_is_not_echo() {
        let tracker = FingerprintTracker::new(WINDOW);
        let fp = tracker.record_at("[]", 10_000);
        assert!(
            !tracker.is_likely_echo(&fp.hash, 15_000),
            "exactly at the window edge must resolve to false"
        );
        assert!(!tracker.is_likely_echo(&fp.hash, 60_000));
    }

    #[test]
    fn different_hash_is_never_echo() {
        let tracker = FingerprintTracker::new(WINDOW);
        tracker.record_at("[{\"title\":\"C\"}]", 10_000);
        assert!(!tracker.is_likely_echo(&content_hash("[{\"title\":\"B\"}]"), 10_001));
    }

    #[test]
    fn only_latest_write_counts() {
        let tracker = FingerprintTracker::new(WINDOW);
        let first = tracker.record_at("first", 10_000);
        let second = tracker.record_at("second", 10_100);
        assert!(!tracker.is_likely_echo(&first.hash, 10_200));
        assert!(tracker.is_likely_echo(&second.hash, 10_200));
    }

    #[test]
    fn time_before_write_is_not_echo() {
        let tracker = FingerprintTracker::new(WINDOW);
        let fp = tracker.record_at("[]", 10_000);
        assert!(!tracker.is_likely_echo(&fp.hash, 9_999));
    }

    #[test]
    fn clear_forgets_last_write() {
        let tracker = FingerprintTracker::new(WINDOW);
        let fp = tracker.record_at("[]", 10_000);
        tracker.clear();
        assert!(!tracker.is_likely_echo(&fp.hash, 10_001));
    }
}
