//! JSON shapes exchanged with the sync service.
//!
//! Every change travels as a [`WireEvent`] whose action is one of the twelve
//! `{folder|file|shortcut}_{create|delete|modify|rename}` strings. The client
//! correlates results with its own events through `event_id`; events without
//! one originate on the server.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on events carried by one push request.
pub const MAX_EVENTS_PER_REQUEST: usize = 1000;

/// Cursor value of a client that has never completed a sync.
pub const DEFAULT_SYNC_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Folder,
    File,
    Shortcut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionVerb {
    Create,
    Delete,
    Modify,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventAction {
    pub entry: EntryType,
    pub verb: ActionVerb,
}

impl EventAction {
    pub const fn new(entry: EntryType, verb: ActionVerb) -> Self {
        Self { entry, verb }
    }

    pub fn as_str(&self) -> &'static str {
        match (self.entry, self.verb) {
            (EntryType::Folder, ActionVerb::Create) => "folder_create",
            (EntryType::Folder, ActionVerb::Delete) => "folder_delete",
            (EntryType::Folder, ActionVerb::Modify) => "folder_modify",
            (EntryType::Folder, ActionVerb::Rename) => "folder_rename",
            (EntryType::File, ActionVerb::Create) => "file_create",
            (EntryType::File, ActionVerb::Delete) => "file_delete",
            (EntryType::File, ActionVerb::Modify) => "file_modify",
            (EntryType::File, ActionVerb::Rename) => "file_rename",
            (EntryType::Shortcut, ActionVerb::Create) => "shortcut_create",
            (EntryType::Shortcut, ActionVerb::Delete) => "shortcut_delete",
            (EntryType::Shortcut, ActionVerb::Modify) => "shortcut_modify",
            (EntryType::Shortcut, ActionVerb::Rename) => "shortcut_rename",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (entry, verb) = value.split_once('_')?;
        let entry = match entry {
            "folder" => EntryType::Folder,
            "file" => EntryType::File,
            "shortcut" => EntryType::Shortcut,
            _ => return None,
        };
        let verb = match verb {
            "create" => ActionVerb::Create,
            "delete" => ActionVerb::Delete,
            "modify" => ActionVerb::Modify,
            "rename" => ActionVerb::Rename,
            _ => return None,
        };
        Some(Self { entry, verb })
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EventAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown event action: {value}"))
    }
}

impl From<EventAction> for String {
    fn from(action: EventAction) -> Self {
        action.as_str().to_string()
    }
}

/// Per-event verdict returned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Accepted,
    Exists,
    Duplicate,
    Noop,
    Download,
    NotFound,
    Upload,
    Uploading,
    Conflict,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    /// RFC 3339, whole seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<String>,
    /// Lowercase hex MD5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub action: EventAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WireMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WireEvent {
    pub fn server_uid(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.server_uid.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub sync_id: String,
    pub device: String,
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub sync_id: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub sync_id: String,
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub revision: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub modified_date: Option<String>,
    #[serde(default)]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionList {
    #[serde(default)]
    pub versions: Vec<FileVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingList {
    #[serde(default)]
    pub files: Vec<WireMetadata>,
}
