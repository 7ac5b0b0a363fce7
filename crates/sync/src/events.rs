use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Enabled,
    Disabled,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub kind: StatusKind,
    pub enabled: bool,
    pub folder_path: String,
    pub message: String,
}

/// A collaborator replaced the shared document.  Carries the freshly read
/// text so the UI does not have to read it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub folder_path: String,
    pub document: String,
}

/// Everything the presentation layer hears about.  Fire-and-forget: late
/// subscribers miss earlier events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStatus(SyncStatusEvent),
    DocumentChanged(ChangeEvent),
}

impl SyncEvent {
    pub fn status(kind: StatusKind, enabled: bool, folder_path: &str, message: impl Into<String>) -> Self {
        Self::SyncStatus(SyncStatusEvent {
            kind,
            enabled,
            folder_path: folder_path.to_string(),
            message: message.into(),
        })
    }

    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            Self::SyncStatus(status) => Some(status.kind),
            Self::DocumentChanged(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_format() {
        let event = SyncEvent::status(StatusKind::Error, false, "/shared", "shared document was removed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "sync-status",
                "kind": "error",
                "enabled": false,
                "folderPath": "/shared",
                "message": "shared document was removed",
            })
        );
    }

    #[test]
    fn change_wire_format() {
        let event = SyncEvent::DocumentChanged(ChangeEvent {
            folder_path: "/shared".to_string(),
            document: "[]".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "document-changed");
        assert_eq!(json["folderPath"], "/shared");
        assert_eq!(json["document"], "[]");
        assert_eq!(event.status_kind(), None);
    }
}
