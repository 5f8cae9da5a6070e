use std::collections::HashSet;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use super::change::{Change, EventId, assign_dependencies};
use super::index::{
    EventStore, apply_completed, find_synced, insert_event, load_event, load_ungrabbed,
    update_event,
};
use super::source::{ChangeSource, GrabbedChanges, MergeItem, SourceError, SyncedItem};

fn flatten(changes: Vec<Change>) -> Vec<Change> {
    let mut out = Vec::new();
    let mut stack: Vec<Change> = changes.into_iter().rev().collect();
    while let Some(mut change) = stack.pop() {
        let dependencies = change.take_dependencies();
        out.push(change);
        stack.extend(dependencies.into_iter().rev());
    }
    out
}

#[async_trait]
impl ChangeSource for EventStore {
    async fn grab_pending_changes(
        &self,
        prior_failures: Vec<Change>,
    ) -> Result<GrabbedChanges, SourceError> {
        let mut tx = self.pool().begin().await?;
        let mut grabbed = GrabbedChanges::default();
        let mut all = Vec::new();
        let mut seen = HashSet::new();

        for mut change in flatten(prior_failures) {
            if change.event_id == 0 {
                match insert_event(&mut tx, &change, true, false).await {
                    Ok(id) => change.event_id = id,
                    Err(err) => {
                        warn!(path = %change.new_path, "failed to persist retried change: {err}");
                        grabbed.changes_in_error.push(change);
                        continue;
                    }
                }
            }
            seen.insert(change.event_id);
            all.push(change);
        }

        let mut promoted = HashSet::new();
        for (decoded, id, is_promoted) in load_ungrabbed(&mut tx).await? {
            sqlx::query("UPDATE events SET grabbed = 1, promoted = 0 WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            match decoded {
                Ok(change) if seen.insert(id) => {
                    if is_promoted {
                        promoted.insert(id);
                    }
                    all.push(change);
                }
                Ok(_) => {}
                Err(err) => warn!(event_id = id, "skipping unreadable pending change: {err}"),
            }
        }
        tx.commit().await?;

        let mut forest = assign_dependencies(all);
        // Work released by a finished parent goes first.
        forest.sort_by_key(|change| !promoted.contains(&change.event_id));
        grabbed.changes = forest;
        Ok(grabbed)
    }

    async fn enqueue_new_changes(
        &self,
        changes: Vec<Change>,
        at_front: bool,
    ) -> Result<Vec<Change>, SourceError> {
        let mut conn = self.pool().acquire().await?;
        let mut failed = Vec::new();
        for change in flatten(changes) {
            let stored = if change.event_id > 0 {
                match update_event(&mut conn, &change).await {
                    Ok(true) => sqlx::query(
                        "UPDATE events SET grabbed = 0, promoted = ?2 WHERE id = ?1",
                    )
                    .bind(change.event_id)
                    .bind(at_front)
                    .execute(&mut *conn)
                    .await
                    .map(|_| ())
                    .map_err(SourceError::from),
                    Ok(false) => insert_event(&mut conn, &change, false, at_front)
                        .await
                        .map(|_| ()),
                    Err(err) => Err(err),
                }
            } else {
                insert_event(&mut conn, &change, false, at_front)
                    .await
                    .map(|_| ())
            };
            if let Err(err) = stored {
                warn!(path = %change.new_path, "failed to enqueue change: {err}");
                failed.push(change);
            }
        }
        Ok(failed)
    }

    async fn reassign_dependencies(
        &self,
        incomplete: Vec<Change>,
        failures: Vec<Change>,
    ) -> Result<(Vec<Change>, Vec<Change>), SourceError> {
        let failure_ids: HashSet<EventId> = flatten(failures.clone())
            .iter()
            .map(|change| change.event_id)
            .collect();
        let mut all = incomplete;
        all.extend(failures);
        let (errors, output): (Vec<_>, Vec<_>) = assign_dependencies(all)
            .into_iter()
            .partition(|change| failure_ids.contains(&change.event_id));
        Ok((output, errors))
    }

    async fn apply_remote_change(&self, mut change: Change) -> Result<Change, SourceError> {
        let mut conn = self.pool().acquire().await?;
        if change.event_id > 0 && update_event(&mut conn, &change).await? {
            return Ok(change);
        }
        change.event_id = insert_event(&mut conn, &change, true, false).await?;
        Ok(change)
    }

    async fn merge_to_persistent_store(&self, item: MergeItem) -> Result<EventId, SourceError> {
        let mut conn = self.pool().acquire().await?;
        match item {
            MergeItem::Upsert(change) => {
                if change.event_id > 0 && update_event(&mut conn, &change).await? {
                    return Ok(change.event_id);
                }
                insert_event(&mut conn, &change, true, false).await
            }
            MergeItem::Remove(event_id) => {
                sqlx::query("DELETE FROM events WHERE id = ?1")
                    .bind(event_id)
                    .execute(&mut *conn)
                    .await?;
                Ok(event_id)
            }
        }
    }

    async fn complete_change(&self, event_id: EventId) -> Result<(), SourceError> {
        if event_id == 0 {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let change = load_event(&mut tx, event_id)
            .await?
            .ok_or(SourceError::MissingEvent(event_id))?;
        apply_completed(&mut tx, &change).await?;
        sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_completed_cursor(
        &self,
        all_changes: &[Change],
        new_cursor: &str,
        completed_ids: &[EventId],
        root_server_uid: Option<&str>,
    ) -> Result<(), SourceError> {
        let completed: HashSet<EventId> = completed_ids.iter().copied().collect();
        let mut tx = self.pool().begin().await?;
        for change in flatten(all_changes.to_vec()) {
            if change.event_id == 0 {
                continue;
            }
            if completed.contains(&change.event_id) {
                apply_completed(&mut tx, &change).await?;
                sqlx::query("DELETE FROM events WHERE id = ?1")
                    .bind(change.event_id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                update_event(&mut tx, &change).await?;
            }
        }
        sqlx::query(
            "UPDATE sync_state SET cursor = ?1, root_uid = COALESCE(?2, root_uid), last_sync = ?3
             WHERE id = 1",
        )
        .bind(new_cursor)
        .bind(root_server_uid)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_metadata_by_path_and_revision(
        &self,
        path: &str,
        revision: Option<&str>,
    ) -> Result<Option<SyncedItem>, SourceError> {
        find_synced(self.pool(), path, revision).await
    }

    async fn get_path_by_server_uid(
        &self,
        server_uid: &str,
    ) -> Result<Option<String>, SourceError> {
        Ok(
            sqlx::query_scalar("SELECT path FROM files WHERE server_uid = ?1 LIMIT 1")
                .bind(server_uid)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    async fn get_server_uid_by_path(&self, path: &str) -> Result<Option<String>, SourceError> {
        if path == "/" {
            return self.root_uid().await;
        }
        Ok(
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT server_uid FROM files WHERE path = ?1",
            )
            .bind(path)
            .fetch_optional(self.pool())
            .await?
            .flatten(),
        )
    }

    async fn last_cursor(&self) -> Result<String, SourceError> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM sync_state WHERE id = 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(cursor.unwrap_or_else(|| "0".to_string()))
    }
}
