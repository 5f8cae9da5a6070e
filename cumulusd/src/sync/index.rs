//! sqlite-backed change source.
//!
//! `events` holds pending changes, `files` the last synced state per path and
//! `sync_state` the cursor plus root uid. A pending row is handed out once per
//! process (`grabbed`); the engine keeps it in memory until it completes or
//! is queued again.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use time::OffsetDateTime;

use super::change::{Change, ChangeKind, ContentHash, Direction, EventId, FileMetadata};
use super::source::{SourceError, SyncedItem};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const EVENT_COLUMNS: &str = "id, direction, kind, is_folder, new_path, old_path, server_uid, size, created, modified, hash, storage_key, revision, parent_uid, target_path, failure_counter, not_found_counter";

const FILE_COLUMNS: &str =
    "path, is_folder, server_uid, size, modified, hash, storage_key, revision, parent_uid, target_path";

#[derive(Debug)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn in_memory() -> Result<Self, SourceError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, SourceError> {
        let parent = db_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or(SourceError::MissingDataDir)?;
        std::fs::create_dir_all(parent)?;
        if db_path.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "{} is a directory",
                db_path.display()
            )));
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Runs migrations and makes every pending row available again, since
    /// nothing survives in memory across a restart.
    pub async fn init(&self) -> Result<(), SourceError> {
        MIGRATOR.run(&self.pool).await?;
        sqlx::query("UPDATE events SET grabbed = 0 WHERE grabbed = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists a locally observed change. A change identical to one that is
    /// still waiting is dropped. Returns the id of the stored row.
    pub async fn record_local_event(&self, change: &Change) -> Result<EventId, SourceError> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM events
             WHERE grabbed = 0 AND direction = ?1 AND kind = ?2 AND new_path = ?3
               AND old_path IS ?4 AND is_folder = ?5
             ORDER BY id DESC LIMIT 1",
        )
        .bind(direction_str(change.direction))
        .bind(change.kind.label())
        .bind(&change.new_path)
        .bind(change.old_path())
        .bind(change.is_folder)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut conn, change, false, false).await
    }

    pub async fn pending_count(&self) -> Result<i64, SourceError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn get_synced(&self, path: &str) -> Result<Option<SyncedItem>, SourceError> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| synced_from_row(&row)).transpose()
    }

    pub async fn root_uid(&self) -> Result<Option<String>, SourceError> {
        Ok(
            sqlx::query_scalar("SELECT root_uid FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?
                .flatten(),
        )
    }
}

pub fn default_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sync").join("events.db")
}

pub(crate) fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::ToServer => "to_server",
        Direction::FromServer => "from_server",
    }
}

fn parse_direction(value: &str) -> Result<Direction, SourceError> {
    match value {
        "to_server" => Ok(Direction::ToServer),
        "from_server" => Ok(Direction::FromServer),
        other => Err(SourceError::Decode(format!("direction {other}"))),
    }
}

fn parse_kind(value: &str, old_path: Option<String>) -> Result<ChangeKind, SourceError> {
    match (value, old_path) {
        ("created", _) => Ok(ChangeKind::Created),
        ("modified", _) => Ok(ChangeKind::Modified),
        ("deleted", _) => Ok(ChangeKind::Deleted),
        ("renamed", Some(old_path)) => Ok(ChangeKind::Renamed { old_path }),
        ("renamed", None) => Err(SourceError::Decode("rename without old path".into())),
        (other, _) => Err(SourceError::Decode(format!("kind {other}"))),
    }
}

fn to_unix(value: Option<OffsetDateTime>) -> Option<i64> {
    value.map(OffsetDateTime::unix_timestamp)
}

fn from_unix(value: Option<i64>) -> Option<OffsetDateTime> {
    value.and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

fn size_to_db(size: Option<u64>) -> Option<i64> {
    size.and_then(|size| i64::try_from(size).ok())
}

fn size_from_db(size: Option<i64>) -> Option<u64> {
    size.and_then(|size| u64::try_from(size).ok())
}

fn counter_from_db(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub(crate) fn change_from_row(row: &SqliteRow) -> Result<Change, SourceError> {
    let direction: String = row.try_get("direction")?;
    let kind: String = row.try_get("kind")?;
    let hash: Option<String> = row.try_get("hash")?;
    let mut change = Change::new(
        parse_direction(&direction)?,
        parse_kind(&kind, row.try_get("old_path")?)?,
        row.try_get::<String, _>("new_path")?,
    );
    change.event_id = row.try_get("id")?;
    change.is_folder = row.try_get("is_folder")?;
    change.server_uid = row.try_get("server_uid")?;
    change.metadata = FileMetadata {
        size: size_from_db(row.try_get("size")?),
        created: from_unix(row.try_get("created")?),
        modified: from_unix(row.try_get("modified")?),
        hash: hash.as_deref().and_then(ContentHash::from_hex),
        storage_key: row.try_get("storage_key")?,
        revision: row.try_get("revision")?,
        parent_uid: row.try_get("parent_uid")?,
        target_path: row.try_get("target_path")?,
    };
    change.failure_counter = counter_from_db(row.try_get("failure_counter")?);
    change.not_found_counter = counter_from_db(row.try_get("not_found_counter")?);
    Ok(change)
}

fn synced_from_row(row: &SqliteRow) -> Result<SyncedItem, SourceError> {
    let hash: Option<String> = row.try_get("hash")?;
    Ok(SyncedItem {
        path: row.try_get("path")?,
        is_folder: row.try_get("is_folder")?,
        server_uid: row.try_get("server_uid")?,
        metadata: FileMetadata {
            size: size_from_db(row.try_get("size")?),
            created: None,
            modified: from_unix(row.try_get("modified")?),
            hash: hash.as_deref().and_then(ContentHash::from_hex),
            storage_key: row.try_get("storage_key")?,
            revision: row.try_get("revision")?,
            parent_uid: row.try_get("parent_uid")?,
            target_path: row.try_get("target_path")?,
        },
    })
}

pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    change: &Change,
    grabbed: bool,
    promoted: bool,
) -> Result<EventId, SourceError> {
    let result = sqlx::query(
        "INSERT INTO events (
            direction, kind, is_folder, new_path, old_path, server_uid, size, created,
            modified, hash, storage_key, revision, parent_uid, target_path,
            failure_counter, not_found_counter, promoted, grabbed
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
    )
    .bind(direction_str(change.direction))
    .bind(change.kind.label())
    .bind(change.is_folder)
    .bind(&change.new_path)
    .bind(change.old_path())
    .bind(&change.server_uid)
    .bind(size_to_db(change.metadata.size))
    .bind(to_unix(change.metadata.created))
    .bind(to_unix(change.metadata.modified))
    .bind(change.metadata.hash.map(|hash| hash.to_hex()))
    .bind(&change.metadata.storage_key)
    .bind(&change.metadata.revision)
    .bind(&change.metadata.parent_uid)
    .bind(&change.metadata.target_path)
    .bind(i64::from(change.failure_counter))
    .bind(i64::from(change.not_found_counter))
    .bind(promoted)
    .bind(grabbed)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Rewrites the stored fields of an existing row. Returns `false` when the
/// row is gone.
pub(crate) async fn update_event(
    conn: &mut SqliteConnection,
    change: &Change,
) -> Result<bool, SourceError> {
    let result = sqlx::query(
        "UPDATE events SET
            direction = ?2, kind = ?3, is_folder = ?4, new_path = ?5, old_path = ?6,
            server_uid = ?7, size = ?8, created = ?9, modified = ?10, hash = ?11,
            storage_key = ?12, revision = ?13, parent_uid = ?14, target_path = ?15,
            failure_counter = ?16, not_found_counter = ?17
        WHERE id = ?1",
    )
    .bind(change.event_id)
    .bind(direction_str(change.direction))
    .bind(change.kind.label())
    .bind(change.is_folder)
    .bind(&change.new_path)
    .bind(change.old_path())
    .bind(&change.server_uid)
    .bind(size_to_db(change.metadata.size))
    .bind(to_unix(change.metadata.created))
    .bind(to_unix(change.metadata.modified))
    .bind(change.metadata.hash.map(|hash| hash.to_hex()))
    .bind(&change.metadata.storage_key)
    .bind(&change.metadata.revision)
    .bind(&change.metadata.parent_uid)
    .bind(&change.metadata.target_path)
    .bind(i64::from(change.failure_counter))
    .bind(i64::from(change.not_found_counter))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn load_event(
    conn: &mut SqliteConnection,
    event_id: EventId,
) -> Result<Option<Change>, SourceError> {
    let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))
        .bind(event_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| change_from_row(&row)).transpose()
}

pub(crate) async fn load_ungrabbed(
    conn: &mut SqliteConnection,
) -> Result<Vec<(Result<Change, SourceError>, EventId, bool)>, SourceError> {
    let rows = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS}, promoted FROM events WHERE grabbed = 0 ORDER BY id ASC"
    ))
    .fetch_all(&mut *conn)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let id: EventId = row.try_get("id")?;
        let promoted: bool = row.try_get("promoted")?;
        out.push((change_from_row(&row), id, promoted));
    }
    Ok(out)
}

/// Folds a completed change into the synced-state table.
pub(crate) async fn apply_completed(
    conn: &mut SqliteConnection,
    change: &Change,
) -> Result<(), SourceError> {
    match &change.kind {
        ChangeKind::Created | ChangeKind::Modified => upsert_file(conn, change).await,
        ChangeKind::Deleted => {
            sqlx::query("DELETE FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2")
                .bind(&change.new_path)
                .bind(format!("{}/", change.new_path))
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
        ChangeKind::Renamed { old_path } => {
            sqlx::query("DELETE FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2")
                .bind(&change.new_path)
                .bind(format!("{}/", change.new_path))
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                "UPDATE files SET path = ?1 || substr(path, length(?2) + 1)
                 WHERE path = ?2 OR substr(path, 1, length(?3)) = ?3",
            )
            .bind(&change.new_path)
            .bind(old_path)
            .bind(format!("{old_path}/"))
            .execute(&mut *conn)
            .await?;
            upsert_file(conn, change).await
        }
    }
}

async fn upsert_file(conn: &mut SqliteConnection, change: &Change) -> Result<(), SourceError> {
    sqlx::query(
        "INSERT INTO files (
            path, is_folder, server_uid, size, modified, hash, storage_key, revision,
            parent_uid, target_path
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(path) DO UPDATE SET
            is_folder = excluded.is_folder,
            server_uid = COALESCE(excluded.server_uid, files.server_uid),
            size = COALESCE(excluded.size, files.size),
            modified = COALESCE(excluded.modified, files.modified),
            hash = COALESCE(excluded.hash, files.hash),
            storage_key = COALESCE(excluded.storage_key, files.storage_key),
            revision = COALESCE(excluded.revision, files.revision),
            parent_uid = COALESCE(excluded.parent_uid, files.parent_uid),
            target_path = excluded.target_path",
    )
    .bind(&change.new_path)
    .bind(change.is_folder)
    .bind(&change.server_uid)
    .bind(size_to_db(change.metadata.size))
    .bind(to_unix(change.metadata.modified))
    .bind(change.metadata.hash.map(|hash| hash.to_hex()))
    .bind(&change.metadata.storage_key)
    .bind(&change.metadata.revision)
    .bind(&change.metadata.parent_uid)
    .bind(&change.metadata.target_path)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn find_synced(
    pool: &SqlitePool,
    path: &str,
    revision: Option<&str>,
) -> Result<Option<SyncedItem>, SourceError> {
    let row = sqlx::query(&format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE path = ?1 AND (?2 IS NULL OR revision = ?2)"
    ))
    .bind(path)
    .bind(revision)
    .fetch_optional(pool)
    .await?;
    row.map(|row| synced_from_row(&row)).transpose()
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
