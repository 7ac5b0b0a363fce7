use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Lets the user choose the shared folder.  Implemented by whatever dialog
/// the front end has.
#[async_trait]
pub trait FolderPicker: Send + Sync {
    /// `current` is the previously used folder, if any.  `None` means the user
    /// cancelled.
    async fn pick_folder(&self, current: Option<&Path>) -> Option<PathBuf>;
}

/// A picker whose answer is known up front (command-line argument, tests).
#[derive(Debug, Clone, Default)]
pub struct FixedFolder(pub Option<PathBuf>);

impl FixedFolder {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self(Some(folder.into()))
    }

    pub fn cancelled() -> Self {
        Self(None)
    }
}

#[async_trait]
impl FolderPicker for FixedFolder {
    async fn pick_folder(&self, _current: Option<&Path>) -> Option<PathBuf> {
        self.0.clone()
    }
}
