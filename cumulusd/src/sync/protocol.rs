//! One exchange with the sync service: root bootstrap, pull, batched push,
//! and interpretation of the per-event verdicts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cumulus_core::{
    ActionVerb, CallStatus, DEFAULT_SYNC_ID, EntryType, EventAction, EventStatus, FileVersion,
    MAX_EVENTS_PER_REQUEST, WireEvent, WireMetadata,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use super::change::{
    Change, ChangeKind, ContentHash, Direction, EventId, FileMetadata, PendingChange, file_name,
    parent_path,
};
use super::engine::Shared;
use super::error::SyncError;
use super::paths::local_path_for;
use super::policy::Channel;
use super::source::MergeItem;
use super::transport::TransportError;

/// Everything one exchange produced. Every submitted change ends up in
/// exactly one of `completed`, `incomplete`, `errored` or `converted`.
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    /// Cursor after the last request that succeeded.
    pub cursor: String,
    /// Set when the root was bootstrapped during this exchange.
    pub root_uid: Option<String>,
    pub completed: Vec<Change>,
    /// Accepted by the server, content still has to be uploaded.
    pub incomplete: Vec<PendingChange>,
    pub errored: Vec<(PendingChange, SyncError)>,
    /// Re-issued under a new shape; already persisted, retried next run.
    pub converted: Vec<Change>,
    pub server_changes: Vec<Change>,
    /// Dependents detached from converted changes.
    pub freed: Vec<Change>,
    pub fatal: Option<SyncError>,
}

impl Exchange {
    fn new(cursor: String) -> Self {
        Self {
            cursor,
            ..Self::default()
        }
    }

    fn fail_all(&mut self, pending: impl IntoIterator<Item = PendingChange>, err: &SyncError) {
        for item in pending {
            let copy = copy_error(err, &item.change.new_path);
            self.errored.push((item, copy));
        }
    }
}

fn copy_error(err: &SyncError, path: &str) -> SyncError {
    match err {
        SyncError::Transport(err) => SyncError::Transport(err.clone()),
        SyncError::Cancelled => SyncError::Cancelled,
        other => SyncError::change(path, other.to_string()),
    }
}

/// Tracks which submitted events already received a verdict.
#[derive(Default)]
struct Ledger {
    order: Vec<EventId>,
    open: HashMap<EventId, PendingChange>,
    closed: HashSet<EventId>,
}

enum Entry {
    Open(PendingChange),
    AlreadyClassified,
    Unknown,
}

impl Ledger {
    fn submit(&mut self, pending: PendingChange) {
        self.order.push(pending.event_id());
        self.open.insert(pending.event_id(), pending);
    }

    fn take(&mut self, event_id: EventId) -> Entry {
        match self.open.remove(&event_id) {
            Some(pending) => {
                self.closed.insert(event_id);
                Entry::Open(pending)
            }
            None if self.closed.contains(&event_id) => Entry::AlreadyClassified,
            None => Entry::Unknown,
        }
    }

    /// Whatever never got a verdict, in submission order.
    fn unclassified(mut self) -> Vec<PendingChange> {
        self.order
            .iter()
            .filter_map(|id| self.open.remove(id))
            .collect()
    }
}

/// Exchanges `batch` with the service. Never fails as a whole: per-change
/// problems land in [`Exchange::errored`], a run-stopping problem in
/// [`Exchange::fatal`].
pub(crate) async fn communicate(
    shared: &Arc<Shared>,
    batch: Vec<PendingChange>,
    cursor: String,
    pull_requested: bool,
    responding_to_push: bool,
) -> Exchange {
    let mut exchange = Exchange::new(cursor);

    let root_uid = match bootstrap_root(shared, &mut exchange).await {
        Ok(uid) => uid,
        Err(err) => {
            exchange.fail_all(batch, &err);
            exchange.fatal = Some(err);
            return exchange;
        }
    };

    let batch_snapshot: Vec<Change> = batch
        .iter()
        .map(|pending| {
            let mut change = pending.change.clone();
            change.dependencies.clear();
            change
        })
        .collect();

    let pull = if batch.is_empty() {
        pull_requested || responding_to_push
    } else {
        responding_to_push
    };

    let mut pulled = Vec::new();
    if pull {
        match shared.transport.pull_changes(&exchange.cursor).await {
            Ok(response) => {
                shared.record_health(Channel::Metadata, CallStatus::Success);
                debug!(
                    cursor = %response.sync_id,
                    events = response.events.len(),
                    "pulled server changes"
                );
                exchange.cursor = response.sync_id;
                pulled = response.events;
            }
            Err(err) => {
                shared.record_health(Channel::Metadata, err.status);
                let err = SyncError::from(err);
                exchange.fail_all(batch, &err);
                exchange.fatal = Some(err);
                return exchange;
            }
        }
    }

    let mut ledger = Ledger::default();
    let mut outgoing = Vec::with_capacity(batch.len());
    for pending in batch {
        match wire_event_for(shared, &pending.change, root_uid.as_deref()).await {
            Ok(event) => {
                outgoing.push(event);
                ledger.submit(pending);
            }
            Err(err) => exchange.errored.push((pending, err)),
        }
    }

    let mut pushed = Vec::new();
    let mut push_failure = None;
    for chunk in outgoing.chunks(MAX_EVENTS_PER_REQUEST) {
        if shared.cancel.is_cancelled() {
            push_failure = Some(SyncError::Cancelled);
            break;
        }
        match shared
            .transport
            .push_changes(chunk.to_vec(), &exchange.cursor)
            .await
        {
            Ok(response) => {
                shared.record_health(Channel::Metadata, CallStatus::Success);
                debug!(
                    cursor = %response.sync_id,
                    sent = chunk.len(),
                    "pushed change batch"
                );
                exchange.cursor = response.sync_id;
                pushed.extend(response.events);
            }
            Err(err) => {
                shared.record_health(Channel::Metadata, err.status);
                warn!("push failed, keeping results so far: {err}");
                push_failure = Some(SyncError::from(err));
                break;
            }
        }
    }

    let (verdicts, pushed_server): (Vec<_>, Vec<_>) =
        pushed.into_iter().partition(|event| event.event_id.is_some());

    for event in verdicts {
        let Some(event_id) = event.event_id else {
            continue;
        };
        match ledger.take(event_id) {
            Entry::Open(pending) => apply_verdict(shared, &mut exchange, pending, event).await,
            Entry::AlreadyClassified => {
                exchange.fatal = Some(SyncError::Invariant(format!(
                    "event {event_id} received two verdicts"
                )));
            }
            Entry::Unknown => {
                warn!(event_id, "service answered for an event that was not sent");
            }
        }
    }

    let leftover = ledger.unclassified();
    match &push_failure {
        Some(err) => exchange.fail_all(leftover, err),
        None => {
            for pending in leftover {
                let err =
                    SyncError::change(&pending.change.new_path, "service returned no verdict");
                exchange.errored.push((pending, err));
            }
        }
    }

    for event in dedup_server_events(pulled, pushed_server) {
        match server_change(shared, &mut exchange, &batch_snapshot, &event).await {
            Ok(Some(change)) => exchange.server_changes.push(change),
            Ok(None) => {}
            Err(err) => warn!(action = %event.action, "dropping server change: {err}"),
        }
    }

    exchange
}

/// Resolves the root folder uid. On a client that never synced, the server
/// side leftovers are purged and the root is fetched fresh.
async fn bootstrap_root(
    shared: &Shared,
    exchange: &mut Exchange,
) -> Result<Option<String>, SyncError> {
    if exchange.cursor != DEFAULT_SYNC_ID {
        return Ok(shared.source.get_server_uid_by_path("/").await?);
    }

    info!("first sync, bootstrapping root");
    let fetched = async {
        shared.transport.purge_pending().await?;
        shared.transport.get_metadata("/", true).await
    }
    .await;
    let root = match fetched {
        Ok(root) => {
            shared.record_health(Channel::Metadata, CallStatus::Success);
            root
        }
        Err(err) => {
            shared.record_health(Channel::Metadata, err.status);
            return Err(err.into());
        }
    };
    let uid = root.and_then(|meta| meta.server_uid);
    exchange.root_uid = uid.clone();
    Ok(uid)
}

async fn wire_event_for(
    shared: &Shared,
    change: &Change,
    root_uid: Option<&str>,
) -> Result<WireEvent, SyncError> {
    let parent_uid = match &change.metadata.parent_uid {
        Some(uid) => Some(uid.clone()),
        None => match parent_path(&change.new_path).as_deref() {
            Some("/") => root_uid.map(str::to_string),
            Some(parent) => shared.source.get_server_uid_by_path(parent).await?,
            None => None,
        },
    };
    Ok(WireEvent {
        action: change.action(),
        event_id: Some(change.event_id),
        status: None,
        metadata: Some(wire_metadata(change, parent_uid)),
        message: None,
    })
}

async fn apply_verdict(
    shared: &Shared,
    exchange: &mut Exchange,
    pending: PendingChange,
    event: WireEvent,
) {
    let PendingChange { mut change, stream } = pending;
    match event.status {
        Some(
            EventStatus::Accepted
            | EventStatus::Exists
            | EventStatus::Duplicate
            | EventStatus::Noop
            | EventStatus::Download,
        ) => {
            merge_response_metadata(&mut change, event.metadata.as_ref());
            exchange.completed.push(change);
        }
        Some(EventStatus::NotFound) if change.kind == ChangeKind::Deleted => {
            exchange.completed.push(change);
        }
        Some(EventStatus::NotFound) => {
            info!(path = %change.new_path, "server lost the item, recreating it");
            change.recreate_as_new();
            let err = SyncError::change(&change.new_path, "not found on server");
            exchange.errored.push((PendingChange::new(change), err));
        }
        Some(EventStatus::Upload | EventStatus::Uploading) => {
            merge_response_metadata(&mut change, event.metadata.as_ref());
            exchange.incomplete.push(PendingChange { change, stream });
        }
        Some(EventStatus::Conflict) => {
            drop(stream);
            resolve_conflict(shared, exchange, change, event.metadata.as_ref()).await;
        }
        Some(EventStatus::Failed | EventStatus::Unknown) | None => {
            let reason = event
                .message
                .unwrap_or_else(|| "rejected by the service".to_string());
            let err = SyncError::change(&change.new_path, reason);
            exchange.errored.push((PendingChange { change, stream }, err));
        }
    }
}

/// Keeps both versions: the local file moves aside and is re-issued as a new
/// creation, and the server version is downloaded to the original path once
/// the re-issued upload went through.
async fn resolve_conflict(
    shared: &Shared,
    exchange: &mut Exchange,
    mut change: Change,
    server: Option<&WireMetadata>,
) {
    let original = change.new_path.clone();
    let renamed = match move_aside(shared, &original).await {
        Ok(renamed) => renamed,
        Err(err) => {
            warn!(path = %original, "conflict rename failed: {err}");
            exchange.errored.push((PendingChange::new(change), err));
            return;
        }
    };
    info!(path = %original, renamed = %renamed, "conflict, keeping both versions");

    exchange.freed.extend(change.take_dependencies());
    change.kind = ChangeKind::Created;
    change.new_path = renamed;
    change.server_uid = None;
    change.metadata.revision = None;
    change.metadata.storage_key = None;

    match server_version(shared, &original, server).await {
        Ok(Some(download)) => match shared.source.apply_remote_change(download).await {
            Ok(download) => change.add_dependency(download),
            Err(err) => warn!(path = %original, "failed to record server version: {err}"),
        },
        Ok(None) => debug!(path = %original, "no server version to restore"),
        Err(err) => warn!(path = %original, "failed to look up server version: {err}"),
    }

    if let Err(err) = shared
        .source
        .merge_to_persistent_store(MergeItem::Upsert(change.clone()))
        .await
    {
        warn!(path = %change.new_path, "failed to persist re-issued change: {err}");
    }
    exchange.converted.push(change);
}

async fn move_aside(shared: &Shared, original: &str) -> Result<String, SyncError> {
    let local = local_path_for(&shared.config.sync_root, original)?;
    let mut siblings = HashSet::new();
    if let Some(folder) = local.parent() {
        let mut entries = tokio::fs::read_dir(folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            siblings.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    let renamed = conflict_path(original, &shared.config.device_name, &siblings);
    let target = local_path_for(&shared.config.sync_root, &renamed)?;
    shared.echo.suppress(original);
    shared.echo.suppress(&renamed);
    tokio::fs::rename(&local, &target).await?;
    Ok(renamed)
}

/// Pseudo-download of the server revision that won the conflict.
async fn server_version(
    shared: &Shared,
    path: &str,
    server: Option<&WireMetadata>,
) -> Result<Option<Change>, TransportError> {
    let Some(server) = server else {
        return Ok(None);
    };
    let mut download = Change::new(Direction::FromServer, ChangeKind::Created, path)
        .with_metadata(metadata_from_wire(server));
    download.server_uid = server.server_uid.clone();

    if download.metadata.storage_key.is_none() {
        let Some(uid) = download.server_uid.clone() else {
            return Ok(None);
        };
        let versions = shared.transport.get_file_versions(&uid).await?;
        let Some(latest) = latest_version(&versions) else {
            return Ok(None);
        };
        apply_version(&mut download.metadata, latest);
    }
    Ok(download.metadata.storage_key.is_some().then_some(download))
}

fn latest_version(versions: &[FileVersion]) -> Option<&FileVersion> {
    versions
        .iter()
        .filter(|version| !version.is_deleted)
        .max_by_key(|version| parse_time(version.modified_date.as_deref()))
}

fn apply_version(metadata: &mut FileMetadata, version: &FileVersion) {
    metadata.revision = Some(version.revision.clone());
    metadata.size = version.size.or(metadata.size);
    metadata.hash = version
        .hash
        .as_deref()
        .and_then(ContentHash::from_hex)
        .or(metadata.hash);
    metadata.modified = parse_time(version.modified_date.as_deref()).or(metadata.modified);
    metadata.storage_key = version.storage_key.clone();
}

/// `"<stem> CONFLICT <device>[ (n)].<ext>"` with the lowest `n` that no
/// sibling uses yet.
pub fn conflict_path(path: &str, device: &str, siblings: &HashSet<String>) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    let mut attempt = 0u32;
    loop {
        let suffix = if attempt == 0 {
            String::new()
        } else {
            format!(" ({attempt})")
        };
        let candidate = match ext {
            Some(ext) => format!("{stem} CONFLICT {device}{suffix}.{ext}"),
            None => format!("{stem} CONFLICT {device}{suffix}"),
        };
        if !siblings.contains(&candidate) {
            return format!("{dir}{candidate}");
        }
        attempt += 1;
    }
}

/// Pull and push can both report changes to the same server item; for any
/// server uid the push reported, its copy replaces everything the pull said.
pub(crate) fn dedup_server_events(pulled: Vec<WireEvent>, pushed: Vec<WireEvent>) -> Vec<WireEvent> {
    let pushed_uids: HashSet<String> = pushed
        .iter()
        .filter_map(|event| event.server_uid().map(str::to_string))
        .collect();
    let mut out: Vec<WireEvent> = pulled
        .into_iter()
        .filter(|event| event.server_uid().is_none_or(|uid| !pushed_uids.contains(uid)))
        .collect();
    out.extend(pushed);
    out
}

/// Turns a server-originated event into a change, filling in what the event
/// leaves out. `None` when there is nothing to apply locally.
async fn server_change(
    shared: &Shared,
    exchange: &mut Exchange,
    batch: &[Change],
    event: &WireEvent,
) -> Result<Option<Change>, SyncError> {
    let Some(meta) = event.metadata.as_ref() else {
        return Err(SyncError::Invariant(format!(
            "{} event without metadata",
            event.action
        )));
    };
    let Some(path) = meta.path.clone() else {
        return Err(SyncError::Invariant(format!("{} event without path", event.action)));
    };

    let kind = match event.action.verb {
        ActionVerb::Create => ChangeKind::Created,
        ActionVerb::Modify => ChangeKind::Modified,
        ActionVerb::Delete => ChangeKind::Deleted,
        ActionVerb::Rename => {
            let old_path = match &meta.from_path {
                Some(old) => Some(old.clone()),
                None => match &meta.server_uid {
                    Some(uid) => shared.source.get_path_by_server_uid(uid).await?,
                    None => None,
                },
            };
            match old_path {
                Some(old_path) => ChangeKind::Renamed { old_path },
                // Never seen locally under another name: plain creation.
                None => ChangeKind::Created,
            }
        }
    };

    let mut change = Change::new(Direction::FromServer, kind, path)
        .with_metadata(metadata_from_wire(meta));
    change.server_uid = meta.server_uid.clone();
    change.is_folder = event.action.entry == EntryType::Folder;

    if change.old_path().is_some() && !change.is_folder && change.metadata.storage_key.is_none() {
        return resolve_rename(shared, exchange, batch, change).await;
    }
    Ok(Some(change))
}

/// Fills a metadata-less rename from the freshest known record of the old
/// path, falling back to the live server state.
async fn resolve_rename(
    shared: &Shared,
    exchange: &mut Exchange,
    batch: &[Change],
    mut change: Change,
) -> Result<Option<Change>, SyncError> {
    let Some(old_path) = change.old_path().map(str::to_string) else {
        return Ok(Some(change));
    };

    let known = match shared.in_flight_find_by_path(&old_path) {
        Some(found) => Some(found.metadata),
        None => match shared.short_queue.find_by_path(&old_path) {
            Some(found) => Some(found.metadata),
            None => match batch.iter().find(|candidate| candidate.new_path == old_path) {
                Some(found) => Some(found.metadata.clone()),
                None => shared
                    .source
                    .get_metadata_by_path_and_revision(
                        &old_path,
                        change.metadata.revision.as_deref(),
                    )
                    .await?
                    .map(|item| item.metadata),
            },
        },
    };

    if let Some(known) = known {
        let revision = change.metadata.revision.take();
        let parent_uid = change.metadata.parent_uid.take();
        change.metadata = FileMetadata {
            revision: revision.or(known.revision.clone()),
            parent_uid: parent_uid.or(known.parent_uid.clone()),
            ..known
        };
        return Ok(Some(change));
    }

    debug!(old = %old_path, new = %change.new_path, "unknown rename source, fetching live state");
    let live = match shared
        .transport
        .get_metadata(&change.new_path, change.is_folder)
        .await
    {
        Ok(live) => {
            shared.record_health(Channel::Metadata, CallStatus::Success);
            live
        }
        Err(err) => {
            shared.record_health(Channel::Metadata, err.status);
            return Err(err.into());
        }
    };

    preserve_local_copy(shared, exchange, &old_path).await;

    Ok(live.map(|live| {
        let mut created = Change::new(Direction::FromServer, ChangeKind::Created, &change.new_path)
            .with_metadata(metadata_from_wire(&live));
        created.server_uid = live.server_uid.clone().or(change.server_uid.take());
        created.is_folder = change.is_folder;
        created
    }))
}

/// A local file at the vacated path is not what the server renamed; upload
/// it as a new file rather than lose it.
async fn preserve_local_copy(shared: &Shared, exchange: &mut Exchange, old_path: &str) {
    let Ok(local) = local_path_for(&shared.config.sync_root, old_path) else {
        return;
    };
    let Some((size, hash)) = super::transfer::hash_file(&local).await else {
        return;
    };
    info!(path = %old_path, "re-uploading local file left behind by a server rename");

    let mut change = Change::new(Direction::ToServer, ChangeKind::Created, old_path);
    change.metadata.size = Some(size);
    change.metadata.hash = Some(hash);
    let event = WireEvent {
        action: EventAction::new(EntryType::File, ActionVerb::Create),
        event_id: None,
        status: None,
        metadata: Some(wire_metadata(&change, None)),
        message: None,
    };
    let response = match shared.transport.post_file_change(event).await {
        Ok(response) => response,
        Err(err) => {
            warn!(path = %old_path, "failed to register local copy: {err}");
            return;
        }
    };
    if !matches!(
        response.status,
        Some(EventStatus::Upload | EventStatus::Uploading)
    ) {
        debug!(path = %old_path, status = ?response.status, "local copy needs no upload");
        return;
    }
    merge_response_metadata(&mut change, response.metadata.as_ref());
    match shared
        .source
        .merge_to_persistent_store(MergeItem::Upsert(change.clone()))
        .await
    {
        Ok(event_id) => {
            change.event_id = event_id;
            exchange.incomplete.push(PendingChange::new(change));
        }
        Err(err) => warn!(path = %old_path, "failed to persist local copy: {err}"),
    }
}

fn merge_response_metadata(change: &mut Change, meta: Option<&WireMetadata>) {
    let Some(meta) = meta else {
        return;
    };
    if meta.server_uid.is_some() {
        change.server_uid = meta.server_uid.clone();
    }
    if meta.revision.is_some() {
        change.metadata.revision = meta.revision.clone();
    }
    if meta.storage_key.is_some() {
        change.metadata.storage_key = meta.storage_key.clone();
    }
}

pub(crate) fn wire_metadata(change: &Change, parent_uid: Option<String>) -> WireMetadata {
    WireMetadata {
        server_uid: change.server_uid.clone(),
        parent_uid,
        path: Some(change.new_path.clone()),
        name: Some(change.name().to_string()),
        from_path: change.old_path().map(str::to_string),
        from_name: change.old_path().map(|old| file_name(old).to_string()),
        created_date: format_time(change.metadata.created),
        modified_date: format_time(change.metadata.modified),
        hash: change.metadata.hash.map(|hash| hash.to_hex()),
        size: change.metadata.size,
        revision: change.metadata.revision.clone(),
        storage_key: change.metadata.storage_key.clone(),
        target_path: change.metadata.target_path.clone(),
    }
}

pub(crate) fn metadata_from_wire(meta: &WireMetadata) -> FileMetadata {
    FileMetadata {
        size: meta.size,
        created: parse_time(meta.created_date.as_deref()),
        modified: parse_time(meta.modified_date.as_deref()),
        hash: meta.hash.as_deref().and_then(ContentHash::from_hex),
        storage_key: meta.storage_key.clone(),
        revision: meta.revision.clone(),
        parent_uid: meta.parent_uid.clone(),
        target_path: meta.target_path.clone(),
    }
}

fn format_time(value: Option<OffsetDateTime>) -> Option<String> {
    value
        .and_then(|value| value.replace_nanosecond(0).ok())
        .and_then(|value| value.format(&Rfc3339).ok())
}

fn parse_time(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok())
}
