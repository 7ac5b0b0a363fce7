use std::io;
use std::path::PathBuf;

use explorer_store::{DocumentError, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("no write permission in {}: {source}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("document {} is missing", .0.display())]
    DocumentMissing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Settings(#[from] anyhow::Error),
}

impl SyncError {
    /// Validation failures: rejected before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotADirectory(_) | Self::PermissionDenied { .. } | Self::Document(_)
        )
    }
}
