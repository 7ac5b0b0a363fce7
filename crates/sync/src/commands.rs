//! Request and response shapes of the operations exposed to the presentation
//! layer.

use serde::{Deserialize, Serialize};

/// Controller state.  `Disabling` is only observable while a transition to
/// `Local` is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Local,
    Remote,
    Disabling,
}

/// Where a document write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTarget {
    Local,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisableOptions {
    /// Copy the shared document over the local one before switching back.
    pub copy_to_local: bool,
}

impl Default for DisableOptions {
    fn default() -> Self {
        Self {
            copy_to_local: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableOutcome {
    pub enabled: bool,
    pub cancelled: bool,
    pub folder_path: String,
    /// The shared document now in effect: the existing one, or the seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableOutcome {
    pub enabled: bool,
    pub folder_path: String,
    pub document: Option<String>,
}
