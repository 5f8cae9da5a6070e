//! Content-addressed bookkeeping for in-progress downloads.
//!
//! When several changes in one folder need the same `(size, hash)` content,
//! only the first one downloads. The others wait and receive their own copy
//! of the finished download.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::change::ContentHash;
use super::paths::TEMP_DIR_NAME;

pub type CopyResult = Result<PathBuf, String>;

#[derive(Debug)]
enum EntryState {
    InFlight {
        followers: Vec<oneshot::Sender<CopyResult>>,
    },
    /// A finished copy whose waiter went away. Owned by the cache until the
    /// next matching claim takes it.
    Ready,
}

#[derive(Debug)]
struct Entry {
    temp_id: u64,
    hash: ContentHash,
    state: EntryState,
}

type Key = (PathBuf, u64);

#[derive(Debug)]
pub enum Claim {
    /// Download it yourself into `lease.temp_path`.
    Leader(Lease),
    /// Someone else is downloading identical content; wait for a copy.
    Follower(oneshot::Receiver<CopyResult>),
    /// Identical content is already on disk and now belongs to the caller.
    Ready(PathBuf),
}

#[derive(Debug)]
pub struct Lease {
    key: Option<(Key, ContentHash)>,
    temp_id: u64,
    pub temp_path: PathBuf,
}

#[derive(Debug)]
pub struct DownloadCache {
    temp_dir: PathBuf,
    next_id: AtomicU64,
    entries: Mutex<HashMap<Key, Vec<Entry>>>,
}

impl DownloadCache {
    /// Creates the temp directory under `sync_root`, discarding leftovers
    /// from an earlier process.
    pub fn new(sync_root: &Path) -> io::Result<Self> {
        let temp_dir = sync_root.join(TEMP_DIR_NAME);
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)?;
        }
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            temp_dir,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn claim(&self, folder: &Path, size: Option<u64>, hash: Option<ContentHash>) -> Claim {
        let (Some(size), Some(hash)) = (size, hash) else {
            return Claim::Leader(self.untracked_lease());
        };
        let key = (folder.to_path_buf(), size);
        let mut entries = self.lock();
        let bucket = entries.entry(key.clone()).or_default();

        if let Some(index) = bucket.iter().position(|entry| {
            entry.hash == hash && matches!(entry.state, EntryState::InFlight { .. })
        }) && let EntryState::InFlight { followers } = &mut bucket[index].state
        {
            let (tx, rx) = oneshot::channel();
            followers.push(tx);
            return Claim::Follower(rx);
        }

        if let Some(index) = bucket.iter().position(|entry| entry.hash == hash) {
            let entry = bucket.remove(index);
            if bucket.is_empty() {
                entries.remove(&key);
            }
            return Claim::Ready(self.path_for(entry.temp_id));
        }

        let temp_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        bucket.push(Entry {
            temp_id,
            hash,
            state: EntryState::InFlight {
                followers: Vec::new(),
            },
        });
        Claim::Leader(Lease {
            key: Some((key, hash)),
            temp_id,
            temp_path: self.path_for(temp_id),
        })
    }

    /// The leader's content is in place at `source`. Every waiting follower
    /// gets its own copy of it and the entry is dropped. The leader's file
    /// is never handed out.
    pub async fn finish(&self, lease: &Lease, source: &Path) {
        let removed = {
            let mut entries = self.lock();
            self.remove(&mut entries, lease)
        };
        let Some(Entry {
            state: EntryState::InFlight { followers },
            ..
        }) = removed
        else {
            return;
        };

        for follower in followers {
            let temp_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let copy = self.path_for(temp_id);
            let result = tokio::fs::copy(source, &copy)
                .await
                .map(|_| copy)
                .map_err(|err| err.to_string());
            if let Err(err) = &result {
                warn!(path = %source.display(), "copy for waiting download failed: {err}");
            }
            if let Err(Ok(orphan)) = follower.send(result) {
                self.park(lease, temp_id, orphan);
            }
        }
    }

    /// The leader's download or move failed; waiting followers fail with it.
    pub async fn fail(&self, lease: &Lease, reason: &str) {
        let removed = {
            let mut entries = self.lock();
            self.remove(&mut entries, lease)
        };
        if let Some(Entry {
            state: EntryState::InFlight { followers },
            ..
        }) = removed
        {
            for follower in followers {
                let _ = follower.send(Err(reason.to_string()));
            }
        }
        let _ = tokio::fs::remove_file(&lease.temp_path).await;
    }

    /// Keeps a copy nobody is waiting for so the next identical claim can
    /// take it without downloading.
    fn park(&self, lease: &Lease, temp_id: u64, path: PathBuf) {
        let Some((key, hash)) = lease.key.clone() else {
            return;
        };
        debug!(path = %path.display(), "keeping unclaimed download copy");
        self.lock().entry(key).or_default().push(Entry {
            temp_id,
            hash,
            state: EntryState::Ready,
        });
    }

    /// Forgets every entry and empties the temp directory.
    pub fn clear(&self) {
        self.lock().clear();
        if let Ok(dir) = std::fs::read_dir(&self.temp_dir) {
            for entry in dir.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        debug!(dir = %self.temp_dir.display(), "download cache cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn untracked_lease(&self) -> Lease {
        let temp_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Lease {
            key: None,
            temp_id,
            temp_path: self.path_for(temp_id),
        }
    }

    fn path_for(&self, temp_id: u64) -> PathBuf {
        self.temp_dir.join(format!("{temp_id}.part"))
    }

    fn find<'a>(
        &self,
        entries: &'a mut HashMap<Key, Vec<Entry>>,
        lease: &Lease,
    ) -> Option<&'a mut Entry> {
        let (key, hash) = lease.key.as_ref()?;
        entries
            .get_mut(key)?
            .iter_mut()
            .find(|entry| entry.temp_id == lease.temp_id && entry.hash == *hash)
    }

    fn remove(&self, entries: &mut HashMap<Key, Vec<Entry>>, lease: &Lease) -> Option<Entry> {
        let (key, _) = lease.key.as_ref()?;
        let bucket = entries.get_mut(key)?;
        let index = bucket
            .iter()
            .position(|entry| entry.temp_id == lease.temp_id)?;
        let entry = bucket.remove(index);
        if bucket.is_empty() {
            entries.remove(key);
        }
        Some(entry)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Vec<Entry>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
