//! Optional shared-folder synchronization of the catalog document.
//!
//! In local mode the document lives in the per-user data directory.  With sync
//! enabled it lives in a user-chosen (usually network) folder that several
//! machines point at; a polling watcher reports changes made by others, and
//! any failure to reach the folder drops the session back to local mode.

mod commands;
mod controller;
mod error;
mod events;
mod picker;
mod watcher;

pub use commands::{DisableOptions, DisableOutcome, EnableOutcome, SyncMode, SyncTarget};
pub use controller::SyncController;
pub use error::SyncError;
pub use events::{ChangeEvent, StatusKind, SyncEvent, SyncStatusEvent};
pub use picker::{FixedFolder, FolderPicker};
pub use watcher::{DocumentWatcher, WatchOptions, WatcherSignal};
