use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::sync::bus::{Counter, PathState};
use crate::sync::change::{ChangeKind, ContentHash, Direction};
use crate::sync::index::EventStore;
use crate::sync::policy::HaltReason;
use crate::sync::source::{ChangeSource, GrabbedChanges, SourceError, SyncedItem};
use crate::sync::test_support::{FakeTransport, RecordingSink};
use async_trait::async_trait;
use cumulus_core::{
    ActionVerb, EntryType, EventAction, EventStatus, FileVersion, WireEvent, WireMetadata,
};
use tempfile::{TempDir, tempdir};

struct Harness {
    engine: SyncEngine,
    store: Arc<EventStore>,
    transport: Arc<FakeTransport>,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
    dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::build(FakeTransport::default(), |_| {}).await
    }

    async fn build(transport: FakeTransport, configure: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build_with_source(transport, configure, |store| store as Arc<dyn ChangeSource>)
            .await
    }

    /// `source` wraps the store the engine talks to; the harness keeps
    /// direct access to the store itself.
    async fn build_with_source(
        transport: FakeTransport,
        configure: impl FnOnce(&mut EngineConfig),
        source: impl FnOnce(Arc<EventStore>) -> Arc<dyn ChangeSource>,
    ) -> Self {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::new(dir.path(), "test-device");
        configure(&mut config);
        let store = Arc::new(EventStore::in_memory().await.unwrap());
        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let engine = SyncEngine::new(
            config,
            transport.clone(),
            source(store.clone()),
            sink.clone(),
            cancel.clone(),
        )
        .unwrap();
        Self {
            engine,
            store,
            transport,
            sink,
            cancel,
            dir,
        }
    }

    fn write(&self, path: &str, content: &[u8]) {
        let local = self.dir.path().join(path.trim_start_matches('/'));
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(local, content).unwrap();
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join(path.trim_start_matches('/'))).ok()
    }

    async fn record(&self, kind: ChangeKind, path: &str, is_folder: bool) {
        let mut change = Change::new(Direction::ToServer, kind, path);
        change.is_folder = is_folder;
        self.store.record_local_event(&change).await.unwrap();
    }

    /// A creation the server already accepted in an earlier session, waiting
    /// for its upload under `storage_key`.
    async fn record_accepted(&self, path: &str, server_uid: &str, storage_key: &str) {
        let mut change = Change::new(Direction::ToServer, ChangeKind::Created, path);
        change.server_uid = Some(server_uid.into());
        change.metadata.storage_key = Some(storage_key.into());
        self.store.record_local_event(&change).await.unwrap();
    }
}

/// Delegates to the store but refuses to commit the first `failures`
/// exchange results.
struct FlakyCommitStore {
    inner: Arc<EventStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl ChangeSource for FlakyCommitStore {
    async fn grab_pending_changes(
        &self,
        prior_failures: Vec<Change>,
    ) -> Result<GrabbedChanges, SourceError> {
        self.inner.grab_pending_changes(prior_failures).await
    }

    async fn enqueue_new_changes(
        &self,
        changes: Vec<Change>,
        at_front: bool,
    ) -> Result<Vec<Change>, SourceError> {
        self.inner.enqueue_new_changes(changes, at_front).await
    }

    async fn reassign_dependencies(
        &self,
        incomplete: Vec<Change>,
        failures: Vec<Change>,
    ) -> Result<(Vec<Change>, Vec<Change>), SourceError> {
        self.inner.reassign_dependencies(incomplete, failures).await
    }

    async fn apply_remote_change(&self, change: Change) -> Result<Change, SourceError> {
        self.inner.apply_remote_change(change).await
    }

    async fn merge_to_persistent_store(&self, item: MergeItem) -> Result<EventId, SourceError> {
        self.inner.merge_to_persistent_store(item).await
    }

    async fn complete_change(&self, event_id: EventId) -> Result<(), SourceError> {
        self.inner.complete_change(event_id).await
    }

    async fn record_completed_cursor(
        &self,
        all_changes: &[Change],
        new_cursor: &str,
        completed_ids: &[EventId],
        root_server_uid: Option<&str>,
    ) -> Result<(), SourceError> {
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(SourceError::Unavailable("disk full".into()));
        }
        self.inner
            .record_completed_cursor(all_changes, new_cursor, completed_ids, root_server_uid)
            .await
    }

    async fn get_metadata_by_path_and_revision(
        &self,
        path: &str,
        revision: Option<&str>,
    ) -> Result<Option<SyncedItem>, SourceError> {
        self.inner
            .get_metadata_by_path_and_revision(path, revision)
            .await
    }

    async fn get_path_by_server_uid(
        &self,
        server_uid: &str,
    ) -> Result<Option<String>, SourceError> {
        self.inner.get_path_by_server_uid(server_uid).await
    }

    async fn get_server_uid_by_path(&self, path: &str) -> Result<Option<String>, SourceError> {
        self.inner.get_server_uid_by_path(path).await
    }

    async fn last_cursor(&self) -> Result<String, SourceError> {
        self.inner.last_cursor().await
    }
}

fn server_file(action: &str, path: &str, uid: &str, key: &str, content: &[u8]) -> WireEvent {
    WireEvent {
        action: EventAction::parse(action).unwrap(),
        event_id: None,
        status: None,
        metadata: Some(WireMetadata {
            server_uid: Some(uid.into()),
            path: Some(path.into()),
            storage_key: Some(key.into()),
            hash: Some(ContentHash::of(content).to_hex()),
            size: Some(content.len() as u64),
            ..WireMetadata::default()
        }),
        message: None,
    }
}

#[tokio::test]
async fn first_run_bootstraps_root_and_uploads_new_file() {
    let h = Harness::new().await;
    h.write("/a.txt", b"hello");
    h.record(ChangeKind::Created, "/a.txt", false).await;

    let summary = h.engine.run(false).await.unwrap();
    assert_eq!(summary.grabbed, 1);
    assert_eq!(summary.dispatched, 1);
    h.engine.wait_for_transfers().await;

    assert_eq!(h.transport.purges(), 1);
    let pushes = h.transport.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "0");
    let meta = pushes[0].1[0].metadata.clone().unwrap();
    assert_eq!(meta.parent_uid.as_deref(), Some("root-uid"));
    assert_eq!(meta.hash, Some(ContentHash::of(b"hello").to_hex()));

    assert_eq!(
        h.transport.uploads(),
        vec![("/a.txt".to_string(), b"hello".to_vec())]
    );
    assert_eq!(h.store.last_cursor().await.unwrap(), "1");
    assert_eq!(h.store.root_uid().await.unwrap().as_deref(), Some("root-uid"));
    let synced = h.store.get_synced("/a.txt").await.unwrap().unwrap();
    assert_eq!(synced.server_uid.as_deref(), Some("uid-1"));
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
    assert_eq!(h.sink.count(Counter::Uploaded), 1);
    assert_eq!(h.sink.last_state("/a.txt"), Some(PathState::Synced));
}

#[tokio::test]
async fn large_batches_are_split_and_cursor_advances_per_request() {
    let h = Harness::new().await;
    for i in 0..2500 {
        h.record(ChangeKind::Created, &format!("/d{i:04}"), true).await;
    }

    let summary = h.engine.run(false).await.unwrap();

    let pushes = h.transport.pushes();
    let sizes: Vec<usize> = pushes.iter().map(|(_, events)| events.len()).collect();
    let cursors: Vec<&str> = pushes.iter().map(|(cursor, _)| cursor.as_str()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    assert_eq!(cursors, vec!["0", "1", "2"]);
    assert_eq!(summary.completed, 2500);
    assert_eq!(summary.cursor.as_deref(), Some("3"));
    assert_eq!(h.store.last_cursor().await.unwrap(), "3");
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
    assert!(h.transport.pulls().is_empty());
}

#[tokio::test]
async fn file_waits_for_its_folder_and_uses_the_new_folder_uid() {
    let h = Harness::new().await;
    h.write("/Docs/a.txt", b"content");
    h.record(ChangeKind::Created, "/Docs", true).await;
    h.record(ChangeKind::Created, "/Docs/a.txt", false).await;

    h.engine.run(false).await.unwrap();
    assert_eq!(h.transport.pushed_paths(), vec!["/Docs".to_string()]);

    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    let pushes = h.transport.pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[1].0, "1");
    let meta = pushes[1].1[0].metadata.clone().unwrap();
    assert_eq!(meta.path.as_deref(), Some("/Docs/a.txt"));
    assert_eq!(meta.parent_uid.as_deref(), Some("uid-1"));
    assert_eq!(
        h.transport.uploads(),
        vec![("/Docs/a.txt".to_string(), b"content".to_vec())]
    );
}

#[tokio::test]
async fn failed_parent_blocks_and_badges_its_dependent() {
    let h = Harness::build(FakeTransport::default(), |config| {
        config.limits = RetryLimits {
            max_failure_retries: 2,
            max_not_founds: 10,
        };
        config.long_retry_interval = None;
    })
    .await;
    h.write("/Docs/a.txt", b"content");
    h.record(ChangeKind::Created, "/Docs", true).await;
    h.record(ChangeKind::Created, "/Docs/a.txt", false).await;
    h.transport.set_verdict("/Docs", EventStatus::Failed);

    let first = h.engine.run(false).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(h.sink.last_state("/Docs"), Some(PathState::Failed));
    assert_eq!(h.engine.shared.short_queue.len(), 1);

    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert!(
        !h.transport
            .pushed_paths()
            .contains(&"/Docs/a.txt".to_string())
    );
    assert!(h.transport.uploads().is_empty());
    assert_eq!(h.sink.last_state("/Docs"), Some(PathState::Failed));
    assert_eq!(h.sink.last_state("/Docs/a.txt"), Some(PathState::Failed));
    assert!(h.engine.shared.short_queue.is_empty());
    assert!(
        h.sink
            .messages()
            .iter()
            .any(|(level, text)| *level == MessageLevel::Important && text.contains("/Docs"))
    );
}

#[tokio::test]
async fn change_unknown_to_the_server_is_sent_again_as_new() {
    let h = Harness::new().await;
    h.write("/a.txt", b"edited");
    h.record(ChangeKind::Modified, "/a.txt", false).await;
    h.transport.set_verdict("/a.txt", EventStatus::NotFound);

    let first = h.engine.run(false).await.unwrap();
    assert_eq!(first.failed, 1);

    h.transport.clear_verdict("/a.txt");
    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    let pushes = h.transport.pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(
        pushes[0].1[0].action,
        EventAction::new(EntryType::File, ActionVerb::Modify)
    );
    assert_eq!(
        pushes[1].1[0].action,
        EventAction::new(EntryType::File, ActionVerb::Create)
    );
    assert_eq!(h.sink.count(Counter::Uploaded), 1);
}

#[tokio::test]
async fn conflict_keeps_both_versions() {
    let h = Harness::new().await;
    h.write("/doc.txt", b"mine");
    h.record(ChangeKind::Created, "/doc.txt", false).await;
    h.transport.set_verdict("/doc.txt", EventStatus::Conflict);
    h.transport.set_metadata(
        "/doc.txt",
        WireMetadata {
            server_uid: Some("srv-uid".into()),
            path: Some("/doc.txt".into()),
            storage_key: Some("srv-key".into()),
            hash: Some(ContentHash::of(b"theirs").to_hex()),
            size: Some(6),
            ..WireMetadata::default()
        },
    );
    h.transport.put_content("srv-key", b"theirs");

    h.engine.run(false).await.unwrap();
    let renamed = "/doc CONFLICT test-device.txt";
    assert_eq!(h.read(renamed).as_deref(), Some(&b"mine"[..]));
    assert!(h.read("/doc.txt").is_none());

    let second = h.engine.run(false).await.unwrap();
    assert_eq!(second.dispatched, 2);
    h.engine.wait_for_transfers().await;

    assert_eq!(h.read("/doc.txt").as_deref(), Some(&b"theirs"[..]));
    assert_eq!(h.read(renamed).as_deref(), Some(&b"mine"[..]));
    assert_eq!(
        h.transport.uploads(),
        vec![(renamed.to_string(), b"mine".to_vec())]
    );
    assert_eq!(h.sink.count(Counter::Downloaded), 1);
}

#[tokio::test]
async fn identical_downloads_in_one_folder_share_a_fetch() {
    let transport = FakeTransport::with_download_delay(Duration::from_millis(50));
    let h = Harness::build(transport, |_| {}).await;
    let photo = b"same bytes";
    h.transport.put_content("k1", photo);
    h.transport.put_content("k2", photo);
    h.transport.queue_pull(vec![
        server_file("file_create", "/Photos/a.jpg", "u1", "k1", photo),
        server_file("file_create", "/Photos/b.jpg", "u2", "k2", photo),
    ]);

    let summary = h.engine.run(false).await.unwrap();
    assert_eq!(summary.server_changes, 2);
    assert_eq!(summary.dispatched, 2);
    h.engine.wait_for_transfers().await;

    assert_eq!(h.transport.download_count(), 1);
    assert_eq!(h.read("/Photos/a.jpg").as_deref(), Some(&photo[..]));
    assert_eq!(h.read("/Photos/b.jpg").as_deref(), Some(&photo[..]));
    assert_eq!(h.sink.count(Counter::Downloaded), 2);
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn initial_run_skips_download_when_local_copy_matches() {
    let h = Harness::new().await;
    h.write("/same.txt", b"already here");
    h.transport.queue_pull(vec![server_file(
        "file_create",
        "/same.txt",
        "u1",
        "k1",
        b"already here",
    )]);

    let summary = h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.transport.download_count(), 0);
    assert_eq!(h.sink.last_state("/same.txt"), Some(PathState::Synced));
    let synced = h.store.get_synced("/same.txt").await.unwrap().unwrap();
    assert_eq!(synced.server_uid.as_deref(), Some("u1"));
}

#[tokio::test]
async fn initial_checks_survive_a_failed_first_run() {
    let h = Harness::new().await;
    h.write("/same.txt", b"already here");
    h.transport.set_outage(Some(TransportError::other("down")));
    assert!(h.engine.run(false).await.is_err());

    h.transport.set_outage(None);
    h.transport.queue_pull(vec![server_file(
        "file_create",
        "/same.txt",
        "u1",
        "k1",
        b"already here",
    )]);
    let summary = h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert!(summary.cursor.is_some());
    assert_eq!(summary.dispatched, 0);
    assert_eq!(h.transport.download_count(), 0);
    assert_eq!(h.sink.last_state("/same.txt"), Some(PathState::Synced));
}

#[tokio::test]
async fn server_rename_and_delete_are_applied_locally() {
    let h = Harness::new().await;
    h.write("/a.txt", b"keep me");
    h.write("/gone.txt", b"bye");
    let mut rename = server_file("file_rename", "/b.txt", "u1", "k-a", b"keep me");
    if let Some(meta) = rename.metadata.as_mut() {
        meta.from_path = Some("/a.txt".into());
    }
    let delete = WireEvent {
        action: EventAction::parse("file_delete").unwrap(),
        event_id: None,
        status: None,
        metadata: Some(WireMetadata {
            server_uid: Some("u2".into()),
            path: Some("/gone.txt".into()),
            ..WireMetadata::default()
        }),
        message: None,
    };
    h.transport.queue_pull(vec![rename, delete]);

    let summary = h.engine.run(false).await.unwrap();
    assert_eq!(summary.server_changes, 2);

    assert_eq!(h.read("/b.txt").as_deref(), Some(&b"keep me"[..]));
    assert!(h.read("/a.txt").is_none());
    assert!(h.read("/gone.txt").is_none());
    assert!(h.engine.echo_filter().is_suppressed("/b.txt"));
    let synced = h.store.get_synced("/b.txt").await.unwrap().unwrap();
    assert_eq!(synced.server_uid.as_deref(), Some("u1"));
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn idle_runs_pull_only_when_asked() {
    let h = Harness::new().await;

    h.engine.run(false).await.unwrap();
    assert_eq!(h.transport.pulls(), vec!["0".to_string()]);

    h.engine.run(false).await.unwrap();
    assert_eq!(h.transport.pulls().len(), 1);

    h.engine.request_poll();
    h.engine.run(false).await.unwrap();
    assert_eq!(h.transport.pulls(), vec!["0".to_string(), "1".to_string()]);

    h.engine.run(true).await.unwrap();
    assert_eq!(h.transport.pulls().len(), 3);
}

#[tokio::test]
async fn repeated_connection_failures_halt_the_engine() {
    let h = Harness::build(FakeTransport::default(), |config| {
        config.max_connection_failures = 2;
    })
    .await;
    h.transport.set_outage(Some(TransportError::new(
        CallStatus::ConnectionFailed,
        "connection refused",
    )));

    for _ in 0..3 {
        let err = h.engine.run(false).await.unwrap_err();
        assert!(err.transport().is_some_and(|err| err.is_connection_failure()));
    }
    assert!(h.engine.is_halted());
    assert!(h.engine.current_status().flags.halted_on_connection_failure);

    h.transport.set_outage(None);
    let err = h.engine.run(false).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Halted(HaltReason::ConnectionFailures(Channel::Metadata))
    ));
    assert_eq!(h.transport.purges(), 0);
    assert!(
        h.sink
            .messages()
            .iter()
            .any(|(level, _)| *level == MessageLevel::Important)
    );
}

#[tokio::test]
async fn cancelled_run_requeues_without_counting() {
    let h = Harness::new().await;
    h.record(ChangeKind::Created, "/Docs", true).await;
    h.cancel.cancel();

    let err = h.engine.run(false).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(h.transport.pushes().is_empty());

    let queued = h.engine.shared.short_queue.find_by_path("/Docs").unwrap();
    assert_eq!(queued.failure_counter, 0);
    assert_eq!(h.sink.last_state("/Docs"), None);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let h = Harness::new().await;
    h.engine.shutdown();
    h.engine.shutdown();
    assert!(h.cancel.is_cancelled());
    assert_eq!(h.engine.transfers_in_flight(), 0);
}

#[tokio::test]
async fn unreachable_service_skips_the_run() {
    let h = Harness::new().await;
    h.write("/a.txt", b"hello");
    h.record(ChangeKind::Created, "/a.txt", false).await;
    h.transport.set_reachable(false);

    let summary = h.engine.run(false).await.unwrap();
    assert_eq!(summary.grabbed, 0);
    assert!(h.transport.pushes().is_empty());
    assert_eq!(h.transport.purges(), 0);
    assert_eq!(h.engine.connection_failures(), 0);
    assert_eq!(h.store.pending_count().await.unwrap(), 1);

    h.transport.set_reachable(true);
    h.engine.run(false).await.unwrap();
    assert_eq!(h.transport.pushed_paths(), vec!["/a.txt".to_string()]);
}

#[tokio::test]
async fn failed_upload_is_retried_until_the_transfer_channel_halts() {
    let h = Harness::build(FakeTransport::default(), |config| {
        config.max_connection_failures = 1;
    })
    .await;
    h.write("/a.txt", b"hello");
    h.record(ChangeKind::Created, "/a.txt", false).await;
    h.transport.fail_uploads_of(
        "/a.txt",
        TransportError::new(CallStatus::ConnectionFailed, "connection reset"),
    );

    let first = h.engine.run(false).await.unwrap();
    assert_eq!(first.dispatched, 1);
    h.engine.wait_for_transfers().await;
    assert!(!h.engine.is_halted());
    let queued = h.engine.shared.short_queue.find_by_path("/a.txt").unwrap();
    assert_eq!(queued.failure_counter, 1);
    assert_eq!(queued.metadata.storage_key.as_deref(), Some("key-1"));
    assert_eq!(h.store.pending_count().await.unwrap(), 1);

    let second = h.engine.run(false).await.unwrap();
    assert_eq!(second.dispatched, 1);
    h.engine.wait_for_transfers().await;
    // The retry goes straight to the transfer; the server already accepted it.
    assert_eq!(h.transport.pushes().len(), 1);
    assert!(h.engine.is_halted());

    let err = h.engine.run(false).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Halted(HaltReason::ConnectionFailures(Channel::Transfer))
    ));
    assert!(h.transport.uploads().is_empty());
    assert!(h.engine.current_status().flags.halted_on_connection_failure);
}

#[tokio::test]
async fn file_left_behind_by_unknown_server_rename_is_uploaded_as_new() {
    let h = Harness::new().await;
    h.write("/old.txt", b"local copy");
    let server = b"server copy";
    let mut rename = server_file("file_rename", "/new.txt", "u9", "k9", server);
    if let Some(meta) = rename.metadata.as_mut() {
        meta.from_path = Some("/old.txt".into());
        meta.storage_key = None;
    }
    h.transport.queue_pull(vec![rename]);
    h.transport.set_metadata(
        "/new.txt",
        WireMetadata {
            server_uid: Some("u9".into()),
            path: Some("/new.txt".into()),
            storage_key: Some("k9".into()),
            hash: Some(ContentHash::of(server).to_hex()),
            size: Some(server.len() as u64),
            ..WireMetadata::default()
        },
    );
    h.transport.put_content("k9", server);

    let summary = h.engine.run(false).await.unwrap();
    assert_eq!(summary.dispatched, 2);
    h.engine.wait_for_transfers().await;

    let posted = h.transport.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(
        posted[0].action,
        EventAction::new(EntryType::File, ActionVerb::Create)
    );
    assert_eq!(
        posted[0].metadata.as_ref().and_then(|meta| meta.path.as_deref()),
        Some("/old.txt")
    );
    assert_eq!(
        h.transport.uploads(),
        vec![("/old.txt".to_string(), b"local copy".to_vec())]
    );
    assert_eq!(h.read("/old.txt").as_deref(), Some(&b"local copy"[..]));
    assert_eq!(h.read("/new.txt").as_deref(), Some(&server[..]));
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn conflict_without_storage_key_downloads_the_latest_version() {
    let h = Harness::new().await;
    h.write("/doc.txt", b"mine");
    h.record(ChangeKind::Created, "/doc.txt", false).await;
    h.transport.set_verdict("/doc.txt", EventStatus::Conflict);
    h.transport.set_metadata(
        "/doc.txt",
        WireMetadata {
            server_uid: Some("srv-uid".into()),
            path: Some("/doc.txt".into()),
            ..WireMetadata::default()
        },
    );
    let version = |revision: &str, modified: &str, key: &str, content: &[u8], deleted| {
        FileVersion {
            revision: revision.into(),
            size: Some(content.len() as u64),
            hash: Some(ContentHash::of(content).to_hex()),
            modified_date: Some(modified.into()),
            storage_key: Some(key.into()),
            is_deleted: deleted,
        }
    };
    h.transport.set_versions(
        "srv-uid",
        vec![
            version("r1", "2024-01-01T00:00:00Z", "old-key", b"old", false),
            version("r2", "2024-06-01T00:00:00Z", "new-key", b"theirs", false),
            version("r3", "2024-09-01T00:00:00Z", "gone-key", b"deleted", true),
        ],
    );
    h.transport.put_content("old-key", b"old");
    h.transport.put_content("new-key", b"theirs");

    h.engine.run(false).await.unwrap();
    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(h.read("/doc.txt").as_deref(), Some(&b"theirs"[..]));
    assert_eq!(
        h.read("/doc CONFLICT test-device.txt").as_deref(),
        Some(&b"mine"[..])
    );
    assert_eq!(h.transport.download_count(), 1);
    assert_eq!(h.sink.count(Counter::Downloaded), 1);
}

#[tokio::test]
async fn initial_run_checks_uploads_the_server_accepted_earlier() {
    let h = Harness::new().await;
    h.write("/resend.txt", b"resend");
    h.write("/waiting.txt", b"waiting");
    h.write("/there.txt", b"there");
    h.record_accepted("/resend.txt", "u-resend", "k-stale").await;
    h.record_accepted("/waiting.txt", "u-waiting", "k-live").await;
    h.record_accepted("/there.txt", "u-there", "k-there").await;
    h.transport.set_pending(vec![WireMetadata {
        storage_key: Some("k-live".into()),
        ..WireMetadata::default()
    }]);
    h.transport.set_metadata(
        "/there.txt",
        WireMetadata {
            server_uid: Some("u-there".into()),
            path: Some("/there.txt".into()),
            hash: Some(ContentHash::of(b"there").to_hex()),
            size: Some(5),
            ..WireMetadata::default()
        },
    );

    let summary = h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(summary.completed, 1);
    assert_eq!(h.transport.pushed_paths(), vec!["/resend.txt".to_string()]);
    let resent = h.transport.pushes()[0].1[0].clone();
    assert_eq!(
        resent.metadata.and_then(|meta| meta.storage_key),
        None,
        "a dropped upload is announced without its old storage key"
    );
    let mut uploads = h.transport.uploads();
    uploads.sort();
    assert_eq!(
        uploads,
        vec![
            ("/resend.txt".to_string(), b"resend".to_vec()),
            ("/waiting.txt".to_string(), b"waiting".to_vec()),
        ]
    );
    assert_eq!(h.sink.last_state("/there.txt"), Some(PathState::Synced));
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn exhausted_long_retries_wait_in_the_long_pool() {
    let h = Harness::build(FakeTransport::default(), |config| {
        config.limits = RetryLimits {
            max_failure_retries: 1,
            max_not_founds: 10,
        };
        config.long_retry_interval = Some(Duration::ZERO);
    })
    .await;
    h.write("/a.txt", b"hello");
    h.record(ChangeKind::Created, "/a.txt", false).await;
    h.transport.set_verdict("/a.txt", EventStatus::Failed);

    let first = h.engine.run(false).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(h.engine.shared.long_pool.len(), 1);
    assert!(h.engine.shared.short_queue.is_empty());
    assert_eq!(h.sink.last_state("/a.txt"), Some(PathState::Failed));

    h.transport.clear_verdict("/a.txt");
    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(h.engine.shared.long_pool.len(), 0);
    assert_eq!(h.transport.pushes().len(), 2);
    assert_eq!(
        h.transport.uploads(),
        vec![("/a.txt".to_string(), b"hello".to_vec())]
    );
    assert_eq!(h.sink.last_state("/a.txt"), Some(PathState::Synced));
}

#[tokio::test]
async fn change_the_server_keeps_missing_is_dropped_and_frees_dependents() {
    let h = Harness::build(FakeTransport::default(), |config| {
        config.limits = RetryLimits {
            max_failure_retries: 20,
            max_not_founds: 1,
        };
    })
    .await;
    h.write("/Docs/a.txt", b"content");
    h.record(ChangeKind::Created, "/Docs", true).await;
    h.record(ChangeKind::Created, "/Docs/a.txt", false).await;
    h.transport.set_verdict("/Docs", EventStatus::NotFound);

    let first = h.engine.run(false).await.unwrap();
    assert_eq!(first.failed, 1);
    assert!(h.engine.shared.short_queue.find_by_path("/Docs").is_none());
    assert_eq!(h.sink.last_state("/Docs"), Some(PathState::None));
    assert_eq!(h.store.pending_count().await.unwrap(), 1);

    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(
        h.transport.pushed_paths(),
        vec!["/Docs".to_string(), "/Docs/a.txt".to_string()]
    );
    assert_eq!(
        h.transport.uploads(),
        vec![("/Docs/a.txt".to_string(), b"content".to_vec())]
    );
}

#[tokio::test]
async fn only_the_failed_part_of_a_batch_is_retried() {
    let h = Harness::new().await;
    for name in ["/a.txt", "/b.txt", "/c.txt"] {
        h.write(name, name.as_bytes());
        h.record(ChangeKind::Created, name, false).await;
    }
    h.transport.set_verdict("/b.txt", EventStatus::Failed);

    let summary = h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(h.transport.pushes().len(), 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dispatched, 2);
    let mut uploaded: Vec<String> = h
        .transport
        .uploads()
        .into_iter()
        .map(|(path, _)| path)
        .collect();
    uploaded.sort();
    assert_eq!(uploaded, vec!["/a.txt".to_string(), "/c.txt".to_string()]);
    let queued = h.engine.shared.short_queue.find_by_path("/b.txt").unwrap();
    assert_eq!(queued.failure_counter, 1);
    assert_eq!(h.sink.last_state("/b.txt"), Some(PathState::Failed));
    assert_eq!(h.store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn dependents_stay_blocked_when_the_cursor_cannot_be_stored() {
    let h = Harness::build_with_source(FakeTransport::default(), |_| {}, |store| {
        Arc::new(FlakyCommitStore {
            inner: store,
            failures: AtomicUsize::new(1),
        }) as Arc<dyn ChangeSource>
    })
    .await;
    h.write("/Docs/a.txt", b"content");
    h.record(ChangeKind::Created, "/Docs", true).await;
    h.record(ChangeKind::Created, "/Docs/a.txt", false).await;

    let err = h.engine.run(false).await.unwrap_err();
    assert!(matches!(err, SyncError::Merge { .. }));
    assert_eq!(h.store.last_cursor().await.unwrap(), "0");
    assert!(
        h.store
            .grab_pending_changes(Vec::new())
            .await
            .unwrap()
            .changes
            .is_empty()
    );
    let queued = h.engine.shared.short_queue.find_by_path("/Docs").unwrap();
    assert_eq!(queued.dependencies.len(), 1);

    h.engine.run(false).await.unwrap();
    h.engine.run(false).await.unwrap();
    h.engine.wait_for_transfers().await;

    assert_eq!(
        h.transport.pushed_paths(),
        vec![
            "/Docs".to_string(),
            "/Docs".to_string(),
            "/Docs/a.txt".to_string()
        ]
    );
    assert_eq!(
        h.transport.uploads(),
        vec![("/Docs/a.txt".to_string(), b"content".to_vec())]
    );
    assert_eq!(h.store.pending_count().await.unwrap(), 0);
}
