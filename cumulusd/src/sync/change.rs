use std::fmt;

use cumulus_core::{ActionVerb, EntryType, EventAction};
use time::{Duration, OffsetDateTime};

use super::transfer::UploadStream;

/// Local sequence number of a persisted change; `0` until persisted.
pub type EventId = i64;

/// The wire format drops sub-second precision, so timestamps closer than
/// this are considered equal.
pub const TIMESTAMP_TOLERANCE: Duration = Duration::seconds(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    FromServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { old_path: String },
}

impl ChangeKind {
    pub fn verb(&self) -> ActionVerb {
        match self {
            ChangeKind::Created => ActionVerb::Create,
            ChangeKind::Modified => ActionVerb::Modify,
            ChangeKind::Deleted => ActionVerb::Delete,
            ChangeKind::Renamed { .. } => ActionVerb::Rename,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed { .. } => "renamed",
        }
    }
}

/// 16-byte MD5 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() != 32 || !value.is_ascii() {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: Option<u64>,
    pub created: Option<OffsetDateTime>,
    pub modified: Option<OffsetDateTime>,
    pub hash: Option<ContentHash>,
    pub storage_key: Option<String>,
    pub revision: Option<String>,
    pub parent_uid: Option<String>,
    /// Set for shortcuts; the path the shortcut points at.
    pub target_path: Option<String>,
}

impl FileMetadata {
    /// Content comparison: hashes win when both sides have one, otherwise
    /// size plus modification time within [`TIMESTAMP_TOLERANCE`].
    pub fn same_content(&self, other: &Self) -> bool {
        match (&self.hash, &other.hash) {
            (Some(left), Some(right)) => left == right && self.size == other.size,
            _ => self.size == other.size && times_match(self.modified, other.modified),
        }
    }
}

pub fn times_match(left: Option<OffsetDateTime>, right: Option<OffsetDateTime>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => (left - right).abs() < TIMESTAMP_TOLERANCE,
        (None, None) => true,
        _ => false,
    }
}

/// One filesystem delta to reconcile with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub event_id: EventId,
    pub server_uid: Option<String>,
    pub direction: Direction,
    pub kind: ChangeKind,
    pub is_folder: bool,
    pub new_path: String,
    pub metadata: FileMetadata,
    pub failure_counter: u32,
    pub not_found_counter: u32,
    /// Changes blocked until this one completes.
    pub dependencies: Vec<Change>,
}

impl Change {
    pub fn new(direction: Direction, kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            event_id: 0,
            server_uid: None,
            direction,
            kind,
            is_folder: false,
            new_path: path.into(),
            metadata: FileMetadata::default(),
            failure_counter: 0,
            not_found_counter: 0,
            dependencies: Vec::new(),
        }
    }

    pub fn folder(mut self) -> Self {
        self.is_folder = true;
        self
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: FileMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn old_path(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::Renamed { old_path } => Some(old_path),
            _ => None,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        if self.is_folder {
            EntryType::Folder
        } else if self.metadata.target_path.is_some() {
            EntryType::Shortcut
        } else {
            EntryType::File
        }
    }

    pub fn action(&self) -> EventAction {
        EventAction::new(self.entry_type(), self.kind.verb())
    }

    /// File creations and modifications move content and need a transfer.
    pub fn is_transfer(&self) -> bool {
        !self.is_folder
            && self.metadata.target_path.is_none()
            && matches!(self.kind, ChangeKind::Created | ChangeKind::Modified)
    }

    pub fn name(&self) -> &str {
        file_name(&self.new_path)
    }

    pub fn add_dependency(&mut self, dependency: Change) {
        self.dependencies.push(dependency);
    }

    /// Detaches the direct dependents, leaving their own subtrees intact.
    pub fn take_dependencies(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.dependencies)
    }

    /// Pre-order walk over every dependency below this change.
    pub fn flatten_dependencies(&self) -> Vec<&Change> {
        let mut out = Vec::new();
        for dependency in &self.dependencies {
            dependency.flatten_into(&mut out);
        }
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Change>) {
        out.push(self);
        for dependency in &self.dependencies {
            dependency.flatten_into(out);
        }
    }

    /// Rewrites a change the server no longer knows into a fresh creation at
    /// the same path, so the next run sends it as new.
    pub fn recreate_as_new(&mut self) {
        self.kind = ChangeKind::Created;
        self.server_uid = None;
        self.metadata.revision = None;
        self.metadata.storage_key = None;
        self.not_found_counter = self.not_found_counter.saturating_add(1);
    }

    pub fn reset_counters(&mut self) {
        self.failure_counter = 0;
        self.not_found_counter = 0;
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::ToServer => "to-server",
            Direction::FromServer => "from-server",
        };
        match self.old_path() {
            Some(old) => write!(
                f,
                "#{} {direction} {} {old} -> {}",
                self.event_id,
                self.kind.label(),
                self.new_path
            ),
            None => write!(
                f,
                "#{} {direction} {} {}",
                self.event_id,
                self.kind.label(),
                self.new_path
            ),
        }
    }
}

/// A change together with the upload stream it owns, if any. Dropping it
/// releases the stream.
#[derive(Debug)]
pub struct PendingChange {
    pub change: Change,
    pub stream: Option<UploadStream>,
}

impl PendingChange {
    pub fn new(change: Change) -> Self {
        Self {
            change,
            stream: None,
        }
    }

    pub fn with_stream(change: Change, stream: UploadStream) -> Self {
        Self {
            change,
            stream: Some(stream),
        }
    }

    pub fn event_id(&self) -> EventId {
        self.change.event_id
    }
}

impl From<Change> for PendingChange {
    fn from(change: Change) -> Self {
        Self::new(change)
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        Some("/".to_string())
    } else {
        Some(parent.to_string())
    }
}

/// True when `path` lies strictly below `ancestor`.
pub fn is_under(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Rebuilds the dependency forest for a set of pending changes. The input is
/// flattened first and taken in event order; a change is attached below the
/// most recent earlier change that must finish before it may run.
pub fn assign_dependencies(changes: Vec<Change>) -> Vec<Change> {
    let mut flat = Vec::new();
    for change in changes {
        flatten_owned(change, &mut flat);
    }
    flat.sort_by_key(|change| {
        if change.event_id > 0 {
            change.event_id
        } else {
            EventId::MAX
        }
    });

    let parents: Vec<Option<usize>> = (0..flat.len())
        .map(|i| (0..i).rev().find(|&j| blocks(&flat[j], &flat[i])))
        .collect();

    let mut children: Vec<Vec<Change>> = (0..flat.len()).map(|_| Vec::new()).collect();
    let mut roots = Vec::new();
    let mut slots: Vec<Option<Change>> = flat.into_iter().map(Some).collect();
    for i in (0..slots.len()).rev() {
        let Some(mut change) = slots[i].take() else {
            continue;
        };
        let mut own = std::mem::take(&mut children[i]);
        own.reverse();
        change.dependencies = own;
        match parents[i] {
            Some(parent) => children[parent].push(change),
            None => roots.push(change),
        }
    }
    roots.reverse();
    roots
}

fn flatten_owned(mut change: Change, out: &mut Vec<Change>) {
    let dependencies = change.take_dependencies();
    out.push(change);
    for dependency in dependencies {
        flatten_owned(dependency, out);
    }
}

fn blocks(earlier: &Change, later: &Change) -> bool {
    let later_paths = [Some(later.new_path.as_str()), later.old_path()];
    for path in later_paths.into_iter().flatten() {
        if path == earlier.new_path {
            return true;
        }
        if earlier.is_folder
            && matches!(
                earlier.kind,
                ChangeKind::Created | ChangeKind::Renamed { .. }
            )
            && is_under(path, &earlier.new_path)
        {
            return true;
        }
    }
    // Something recreated at a path vacated by a rename waits for the rename.
    earlier.old_path() == Some(later.new_path.as_str())
}
