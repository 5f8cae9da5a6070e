//! Fakes shared by the sync unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cumulus_core::{
    ActionVerb, EventStatus, FileVersion, SyncResponse, WireEvent, WireMetadata,
};
use tokio::io::AsyncReadExt;

use super::bus::{Counter, MessageLevel, NotificationSink, PathState};
use super::change::{Change, ContentHash};
use super::status::SyncStatus;
use super::transfer::UploadStream;
use super::transport::{ProgressFn, Transport, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(MessageLevel, String)>>,
    path_states: Mutex<Vec<(String, PathState)>>,
    counters: Mutex<HashMap<Counter, usize>>,
    statuses: Mutex<Vec<SyncStatus>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        lock(&self.messages).clone()
    }

    pub fn path_states(&self) -> Vec<(String, PathState)> {
        lock(&self.path_states).clone()
    }

    pub fn last_state(&self, path: &str) -> Option<PathState> {
        lock(&self.path_states)
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, state)| *state)
    }

    pub fn count(&self, counter: Counter) -> usize {
        lock(&self.counters).get(&counter).copied().unwrap_or(0)
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        lock(&self.statuses).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn message(&self, level: MessageLevel, text: &str) {
        lock(&self.messages).push((level, text.to_string()));
    }

    fn path_state(&self, path: &str, state: PathState) {
        lock(&self.path_states).push((path.to_string(), state));
    }

    fn increment(&self, counter: Counter) {
        *lock(&self.counters).entry(counter).or_default() += 1;
    }

    fn status(&self, status: &SyncStatus) {
        lock(&self.statuses).push(status.clone());
    }
}

#[derive(Default)]
struct FakeState {
    cursor: u64,
    pushes: Vec<(String, Vec<WireEvent>)>,
    pulls: Vec<String>,
    pull_events: VecDeque<Vec<WireEvent>>,
    verdicts: HashMap<String, EventStatus>,
    metadata: HashMap<String, WireMetadata>,
    versions: HashMap<String, Vec<FileVersion>>,
    pending: Vec<WireMetadata>,
    contents: HashMap<String, Vec<u8>>,
    uploads: Vec<(String, Vec<u8>)>,
    failing_uploads: HashMap<String, TransportError>,
    posted: Vec<WireEvent>,
    outage: Option<TransportError>,
    purges: usize,
}

/// Scripted stand-in for the sync service. Unless told otherwise, file
/// creations and modifications are answered with `upload`, everything else
/// with `accepted`, and every request advances the cursor by one.
pub struct FakeTransport {
    state: Mutex<FakeState>,
    downloads: AtomicUsize,
    download_delay: Duration,
    reachable: AtomicBool,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::with_download_delay(Duration::ZERO)
    }
}

impl FakeTransport {
    pub fn with_download_delay(download_delay: Duration) -> Self {
        let mut state = FakeState::default();
        state.metadata.insert(
            "/".into(),
            WireMetadata {
                server_uid: Some("root-uid".into()),
                path: Some("/".into()),
                ..WireMetadata::default()
            },
        );
        Self {
            state: Mutex::new(state),
            downloads: AtomicUsize::new(0),
            download_delay,
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_verdict(&self, path: &str, status: EventStatus) {
        lock(&self.state).verdicts.insert(path.into(), status);
    }

    pub fn clear_verdict(&self, path: &str) {
        lock(&self.state).verdicts.remove(path);
    }

    pub fn set_metadata(&self, path: &str, metadata: WireMetadata) {
        lock(&self.state).metadata.insert(path.into(), metadata);
    }

    pub fn set_versions(&self, server_uid: &str, versions: Vec<FileVersion>) {
        lock(&self.state).versions.insert(server_uid.into(), versions);
    }

    pub fn set_pending(&self, pending: Vec<WireMetadata>) {
        lock(&self.state).pending = pending;
    }

    pub fn put_content(&self, storage_key: &str, bytes: &[u8]) {
        lock(&self.state)
            .contents
            .insert(storage_key.into(), bytes.to_vec());
    }

    pub fn queue_pull(&self, events: Vec<WireEvent>) {
        lock(&self.state).pull_events.push_back(events);
    }

    pub fn fail_uploads_of(&self, path: &str, err: TransportError) {
        lock(&self.state).failing_uploads.insert(path.into(), err);
    }

    /// Every metadata call fails with `err` until cleared.
    pub fn set_outage(&self, err: Option<TransportError>) {
        lock(&self.state).outage = err;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<(String, Vec<WireEvent>)> {
        lock(&self.state).pushes.clone()
    }

    pub fn pushed_paths(&self) -> Vec<String> {
        lock(&self.state)
            .pushes
            .iter()
            .flat_map(|(_, events)| events.iter())
            .filter_map(|event| event.metadata.as_ref()?.path.clone())
            .collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        lock(&self.state).pulls.clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).uploads.clone()
    }

    pub fn posted(&self) -> Vec<WireEvent> {
        lock(&self.state).posted.clone()
    }

    pub fn purges(&self) -> usize {
        lock(&self.state).purges
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_outage(&self) -> Result<(), TransportError> {
        match &lock(&self.state).outage {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn verdict_for(state: &FakeState, event: &WireEvent) -> WireEvent {
        let meta = event.metadata.clone().unwrap_or_default();
        let path = meta.path.clone().unwrap_or_default();
        let event_id = event.event_id.unwrap_or_default();
        let default = match event.action.verb {
            ActionVerb::Create | ActionVerb::Modify
                if event.action.entry == cumulus_core::EntryType::File =>
            {
                EventStatus::Upload
            }
            _ => EventStatus::Accepted,
        };
        let status = state.verdicts.get(&path).copied().unwrap_or(default);

        let metadata = match status {
            EventStatus::Conflict => state.metadata.get(&path).cloned(),
            _ => Some(WireMetadata {
                server_uid: meta
                    .server_uid
                    .clone()
                    .or_else(|| Some(format!("uid-{event_id}"))),
                revision: Some(format!("rev-{event_id}")),
                storage_key: matches!(status, EventStatus::Upload | EventStatus::Uploading)
                    .then(|| format!("key-{event_id}")),
                ..meta
            }),
        };
        WireEvent {
            action: event.action,
            event_id: event.event_id,
            status: Some(status),
            metadata,
            message: None,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn push_changes(
        &self,
        events: Vec<WireEvent>,
        cursor: &str,
    ) -> Result<SyncResponse, TransportError> {
        self.check_outage()?;
        let mut state = lock(&self.state);
        let verdicts = events
            .iter()
            .map(|event| Self::verdict_for(&state, event))
            .collect();
        state.pushes.push((cursor.to_string(), events));
        state.cursor += 1;
        Ok(SyncResponse {
            sync_id: state.cursor.to_string(),
            events: verdicts,
        })
    }

    async fn pull_changes(&self, cursor: &str) -> Result<SyncResponse, TransportError> {
        self.check_outage()?;
        let mut state = lock(&self.state);
        state.pulls.push(cursor.to_string());
        state.cursor += 1;
        let events = state.pull_events.pop_front().unwrap_or_default();
        Ok(SyncResponse {
            sync_id: state.cursor.to_string(),
            events,
        })
    }

    async fn purge_pending(&self) -> Result<(), TransportError> {
        self.check_outage()?;
        lock(&self.state).purges += 1;
        Ok(())
    }

    async fn get_metadata(
        &self,
        path: &str,
        _is_folder: bool,
    ) -> Result<Option<WireMetadata>, TransportError> {
        self.check_outage()?;
        Ok(lock(&self.state).metadata.get(path).cloned())
    }

    async fn get_file_versions(
        &self,
        server_uid: &str,
    ) -> Result<Vec<FileVersion>, TransportError> {
        self.check_outage()?;
        Ok(lock(&self.state)
            .versions
            .get(server_uid)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_all_pending(&self) -> Result<Vec<WireMetadata>, TransportError> {
        self.check_outage()?;
        Ok(lock(&self.state).pending.clone())
    }

    async fn upload(
        &self,
        stream: UploadStream,
        change: &Change,
        progress: ProgressFn,
    ) -> Result<(), TransportError> {
        if let Some(err) = lock(&self.state).failing_uploads.get(&change.new_path) {
            return Err(err.clone());
        }
        let mut file = stream.into_file();
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        progress(bytes.len() as u64);
        let mut state = lock(&self.state);
        if let Some(key) = &change.metadata.storage_key {
            state.contents.insert(key.clone(), bytes.clone());
        }
        state.uploads.push((change.new_path.clone(), bytes));
        Ok(())
    }

    async fn download(
        &self,
        change: &Change,
        temp_path: &Path,
        progress: ProgressFn,
    ) -> Result<(), TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }
        let bytes = {
            let state = lock(&self.state);
            change
                .metadata
                .storage_key
                .as_ref()
                .and_then(|key| state.contents.get(key).cloned())
        };
        let Some(bytes) = bytes else {
            return Err(TransportError::not_found(format!(
                "no content for {}",
                change.new_path
            )));
        };
        if let Some(expected) = change.metadata.hash
            && expected != ContentHash::of(&bytes)
        {
            return Err(TransportError::other("integrity check failed"));
        }
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(temp_path, &bytes).await?;
        progress(bytes.len() as u64);
        Ok(())
    }

    async fn post_file_change(&self, event: WireEvent) -> Result<WireEvent, TransportError> {
        self.check_outage()?;
        let mut state = lock(&self.state);
        state.posted.push(event.clone());
        let mut response = Self::verdict_for(&state, &event);
        response.event_id = None;
        Ok(response)
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
