use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::change::{Change, ChangeKind, Direction, is_under};
use super::paths::{is_internal, remote_path_for};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created { path: String },
    Modified { path: String },
    Deleted { path: String },
    Moved { from: String, to: String },
}

impl LocalEvent {
    pub fn path(&self) -> &str {
        match self {
            LocalEvent::Created { path }
            | LocalEvent::Modified { path }
            | LocalEvent::Deleted { path } => path,
            LocalEvent::Moved { to, .. } => to,
        }
    }

    pub fn into_change(self, is_folder: bool) -> Change {
        let (kind, path) = match self {
            LocalEvent::Created { path } => (ChangeKind::Created, path),
            LocalEvent::Modified { path } => (ChangeKind::Modified, path),
            LocalEvent::Deleted { path } => (ChangeKind::Deleted, path),
            LocalEvent::Moved { from, to } => (ChangeKind::Renamed { old_path: from }, to),
        };
        let mut change = Change::new(Direction::ToServer, kind, path);
        change.is_folder = is_folder;
        change
    }
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    to_remote_path(root, &event.paths[0]),
                    to_remote_path(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Moved { from, to }];
            }
            Vec::new()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => remote_paths(root, event.paths)
            .map(|path| LocalEvent::Deleted { path })
            .collect(),
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            remote_paths(root, event.paths)
                .map(|path| LocalEvent::Created { path })
                .collect()
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => remote_paths(root, event.paths)
            .map(|path| LocalEvent::Modified { path })
            .collect(),
        EventKind::Remove(_) => remote_paths(root, event.paths)
            .map(|path| LocalEvent::Deleted { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn remote_paths(root: &Path, paths: Vec<PathBuf>) -> impl Iterator<Item = String> + '_ {
    paths
        .into_iter()
        .filter_map(move |path| to_remote_path(root, &path))
}

fn to_remote_path(root: &Path, path: &Path) -> Option<String> {
    let remote = remote_path_for(root, path).ok()?;
    if remote == "/" || is_internal(&remote) {
        return None;
    }
    Some(remote)
}

/// Paths the engine itself just touched. Watcher events for them (or for
/// anything below them) are dropped until the entry expires.
#[derive(Debug)]
pub struct EchoFilter {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(3))
    }
}

impl EchoFilter {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn suppress(&self, path: &str) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(path.to_string(), Instant::now() + self.ttl);
    }

    pub fn is_suppressed(&self, path: &str) -> bool {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, until| *until > now);
        entries
            .keys()
            .any(|suppressed| suppressed == path || is_under(path, suppressed))
    }
}
