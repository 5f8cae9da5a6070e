//! Per-change work that needs no exchange with the sync service: server
//! changes applied to the local tree, and uploads the server accepted in an
//! earlier run.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::change::{Change, ChangeKind, Direction, PendingChange};
use super::engine::Shared;
use super::error::{Step, SyncError};
use super::paths::local_path_for;
use super::policy::Channel;
use super::transfer::hash_file;

#[derive(Debug)]
pub(crate) enum Disposition {
    /// Done locally; persist the completion.
    Completed(Change),
    Transfer(PendingChange),
    /// Needs the sync service.
    Communicate(Change),
}

pub(crate) async fn preprocess_one(
    shared: &Shared,
    change: Change,
    pending_uploads: &mut Option<HashSet<String>>,
) -> Step<Disposition> {
    match change.direction {
        Direction::FromServer => apply_server_change(shared, change).await,
        Direction::ToServer => prepare_local_change(shared, change, pending_uploads).await,
    }
}

async fn apply_server_change(shared: &Shared, change: Change) -> Step<Disposition> {
    // Shortcuts only exist on the server side.
    if change.metadata.target_path.is_some() {
        return Step::Done(Disposition::Completed(change));
    }
    let local = match local_path_for(&shared.config.sync_root, &change.new_path) {
        Ok(local) => local,
        Err(err) => return Step::retry(change, err),
    };

    let applied = match change.kind.clone() {
        ChangeKind::Deleted => remove_local(shared, &change.new_path, &local).await,
        ChangeKind::Renamed { old_path } => {
            match rename_local(shared, &old_path, &change.new_path, &local).await {
                Ok(true) => Ok(()),
                Ok(false) if change.is_folder => {
                    create_folder(shared, &change.new_path, &local).await
                }
                Ok(false) => return download_or_skip(shared, change, &local).await,
                Err(err) => Err(err),
            }
        }
        ChangeKind::Created | ChangeKind::Modified if change.is_folder => {
            create_folder(shared, &change.new_path, &local).await
        }
        ChangeKind::Created | ChangeKind::Modified => {
            return download_or_skip(shared, change, &local).await;
        }
    };

    match applied {
        Ok(()) => {
            debug!(event_id = change.event_id, path = %change.new_path, kind = change.kind.label(), "applied server change");
            Step::Done(Disposition::Completed(change))
        }
        Err(err) => Step::retry(change, err),
    }
}

async fn download_or_skip(shared: &Shared, change: Change, local: &Path) -> Step<Disposition> {
    if shared.initial_run.load(Ordering::SeqCst)
        && let Some(expected) = change.metadata.hash
        && let Some((size, hash)) = hash_file(local).await
        && hash == expected
        && change.metadata.size.is_none_or(|expected| expected == size)
    {
        debug!(path = %change.new_path, "local copy already matches server content");
        return Step::Done(Disposition::Completed(change));
    }
    if change.metadata.storage_key.is_none() {
        let path = change.new_path.clone();
        return Step::retry(change, SyncError::change(path, "server change has no content key"));
    }
    Step::Done(Disposition::Transfer(PendingChange::new(change)))
}

async fn remove_local(shared: &Shared, path: &str, local: &Path) -> Result<(), SyncError> {
    let meta = match tokio::fs::symlink_metadata(local).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    shared.echo.suppress(path);
    if meta.is_dir() {
        tokio::fs::remove_dir_all(local).await?;
    } else {
        tokio::fs::remove_file(local).await?;
    }
    info!(path, "removed after server deletion");
    Ok(())
}

/// Moves the local item; `false` when there was nothing at the old path.
async fn rename_local(
    shared: &Shared,
    old_path: &str,
    new_path: &str,
    local: &Path,
) -> Result<bool, SyncError> {
    let old_local = local_path_for(&shared.config.sync_root, old_path)?;
    if tokio::fs::symlink_metadata(&old_local).await.is_err() {
        return Ok(false);
    }
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    shared.echo.suppress(old_path);
    shared.echo.suppress(new_path);
    tokio::fs::rename(&old_local, local).await?;
    info!(from = old_path, to = new_path, "moved after server rename");
    Ok(true)
}

async fn create_folder(shared: &Shared, path: &str, local: &Path) -> Result<(), SyncError> {
    shared.echo.suppress(path);
    tokio::fs::create_dir_all(local).await?;
    Ok(())
}

enum UploadCheck {
    Upload,
    AlreadyThere,
    /// The server dropped the pending upload; announce the file again.
    Resend,
}

async fn prepare_local_change(
    shared: &Shared,
    mut change: Change,
    pending_uploads: &mut Option<HashSet<String>>,
) -> Step<Disposition> {
    let accepted_earlier = change.is_transfer()
        && change.server_uid.is_some()
        && change.metadata.storage_key.is_some();
    if !accepted_earlier {
        return Step::Done(Disposition::Communicate(change));
    }
    if !shared.initial_run.load(Ordering::SeqCst) {
        return Step::Done(Disposition::Transfer(PendingChange::new(change)));
    }

    match check_upload(shared, &change, pending_uploads).await {
        Ok(UploadCheck::Upload) => Step::Done(Disposition::Transfer(PendingChange::new(change))),
        Ok(UploadCheck::AlreadyThere) => {
            debug!(path = %change.new_path, "server already has the local content");
            Step::Done(Disposition::Completed(change))
        }
        Ok(UploadCheck::Resend) => {
            change.metadata.storage_key = None;
            Step::Done(Disposition::Communicate(change))
        }
        Err(err) => Step::retry(change, err),
    }
}

async fn check_upload(
    shared: &Shared,
    change: &Change,
    pending_uploads: &mut Option<HashSet<String>>,
) -> Result<UploadCheck, SyncError> {
    let local = local_path_for(&shared.config.sync_root, &change.new_path)?;
    let Some((size, hash)) = hash_file(&local).await else {
        // Let the transfer report the missing file.
        return Ok(UploadCheck::Upload);
    };

    let remote = shared.observe(
        Channel::Metadata,
        shared.transport.get_metadata(&change.new_path, false).await,
    )?;
    if let Some(remote) = remote
        && remote.hash.as_deref() == Some(hash.to_hex().as_str())
        && remote.size == Some(size)
    {
        return Ok(UploadCheck::AlreadyThere);
    }

    if pending_uploads.is_none() {
        let listed = shared.observe(
            Channel::Metadata,
            shared.transport.get_all_pending().await,
        )?;
        *pending_uploads = Some(
            listed
                .into_iter()
                .filter_map(|meta| meta.storage_key)
                .collect(),
        );
    }
    let waiting = match (pending_uploads.as_ref(), &change.metadata.storage_key) {
        (Some(pending), Some(key)) => pending.contains(key),
        _ => false,
    };
    if waiting {
        Ok(UploadCheck::Upload)
    } else {
        warn!(path = %change.new_path, "server no longer expects this upload");
        Ok(UploadCheck::Resend)
    }
}
