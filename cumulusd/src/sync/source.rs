use async_trait::async_trait;
use thiserror::Error;

use super::change::{Change, EventId, FileMetadata};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is not available")]
    MissingDataDir,
    #[error("stored change is malformed: {0}")]
    Decode(String),
    #[error("no pending change with id {0}")]
    MissingEvent(EventId),
    #[error("change source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
pub struct GrabbedChanges {
    /// Dependency forest of everything pending, prior failures included.
    pub changes: Vec<Change>,
    /// Changes that could not be persisted or read back.
    pub changes_in_error: Vec<Change>,
}

#[derive(Debug, Clone)]
pub enum MergeItem {
    Upsert(Change),
    Remove(EventId),
}

/// Last known synced state of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedItem {
    pub path: String,
    pub is_folder: bool,
    pub server_uid: Option<String>,
    pub metadata: FileMetadata,
}

/// Durable record of pending changes and synced state.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Returns pending changes not handed out yet, merged with
    /// `prior_failures` into one dependency forest.
    async fn grab_pending_changes(
        &self,
        prior_failures: Vec<Change>,
    ) -> Result<GrabbedChanges, SourceError>;

    /// Persists changes for a later run. Returns the ones that could not be
    /// stored.
    async fn enqueue_new_changes(
        &self,
        changes: Vec<Change>,
        at_front: bool,
    ) -> Result<Vec<Change>, SourceError>;

    /// Rebuilds dependencies across both lists. Returns the dispatchable
    /// forest and the roots that are, or are blocked by, failures.
    async fn reassign_dependencies(
        &self,
        incomplete: Vec<Change>,
        failures: Vec<Change>,
    ) -> Result<(Vec<Change>, Vec<Change>), SourceError>;

    /// Persists a server-originated change; the result carries its event id.
    async fn apply_remote_change(&self, change: Change) -> Result<Change, SourceError>;

    async fn merge_to_persistent_store(&self, item: MergeItem) -> Result<EventId, SourceError>;

    async fn complete_change(&self, event_id: EventId) -> Result<(), SourceError>;

    /// Stores the outcome of one communication together with the new cursor.
    async fn record_completed_cursor(
        &self,
        all_changes: &[Change],
        new_cursor: &str,
        completed_ids: &[EventId],
        root_server_uid: Option<&str>,
    ) -> Result<(), SourceError>;

    async fn get_metadata_by_path_and_revision(
        &self,
        path: &str,
        revision: Option<&str>,
    ) -> Result<Option<SyncedItem>, SourceError>;

    async fn get_path_by_server_uid(&self, server_uid: &str)
    -> Result<Option<String>, SourceError>;

    /// `/` resolves to the stored root uid.
    async fn get_server_uid_by_path(&self, path: &str) -> Result<Option<String>, SourceError>;

    /// `"0"` when nothing was synced yet.
    async fn last_cursor(&self) -> Result<String, SourceError>;
}
