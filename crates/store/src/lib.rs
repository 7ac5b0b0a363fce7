pub mod atomic;
pub mod document;
pub mod fingerprint;

pub use atomic::{RetryPolicy, WriteError, is_temp_file_name, read_with_retry, write_atomic};
pub use document::{Document, DocumentError, ProjectRecord, normalize_stored_path};
pub use fingerprint::{Fingerprint, FingerprintTracker, content_hash};
