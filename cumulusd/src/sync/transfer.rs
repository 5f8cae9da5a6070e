use std::{
    env, io,
    path::Path,
    sync::Arc,
};

use md5::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::bus::{Counter, MessageLevel, PathState};
use super::change::{Change, ContentHash, Direction, PendingChange};
use super::download_cache::Claim;
use super::engine::Shared;
use super::paths::local_path_for;
use super::policy::Channel;
use super::queue::RunTrigger;
use super::status::StatusEvent;
use super::transport::TransportError;

const HASH_CHUNK: usize = 64 * 1024;

/// An open file positioned at its start, plus the length and digest taken
/// when it was opened.
#[derive(Debug)]
pub struct UploadStream {
    file: tokio::fs::File,
    len: u64,
    hash: ContentHash,
}

impl UploadStream {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let mut md5 = Context::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            md5.consume(&buf[..read]);
        }
        file.rewind().await?;
        Ok(Self {
            file,
            len,
            hash: ContentHash(md5.compute().0),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn into_file(self) -> tokio::fs::File {
        self.file
    }
}

/// Digest of a local file, `None` if it cannot be read.
pub async fn hash_file(path: &Path) -> Option<(u64, ContentHash)> {
    let stream = UploadStream::open(path).await.ok()?;
    Some((stream.len(), stream.hash()))
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 6,
            upload_concurrency: 6,
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            download_concurrency: read_limit(
                "CUMULUS_DOWNLOAD_CONCURRENCY",
                defaults.download_concurrency,
            ),
            upload_concurrency: read_limit(
                "CUMULUS_UPLOAD_CONCURRENCY",
                defaults.upload_concurrency,
            ),
        }
    }
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// One bounded pool per direction.
#[derive(Debug, Clone)]
pub struct TransferPools {
    upload: Arc<Semaphore>,
    download: Arc<Semaphore>,
}

impl TransferPools {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            upload: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            download: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
        }
    }

    pub fn for_direction(&self, direction: Direction) -> Arc<Semaphore> {
        match direction {
            Direction::ToServer => self.upload.clone(),
            Direction::FromServer => self.download.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TransferOutcome {
    Done(Change),
    Cancelled(Change),
    Failed(Change, TransportError),
}

impl Shared {
    /// Registers the change as in flight and schedules it on its pool.
    pub(crate) fn dispatch_transfer(self: &Arc<Self>, pending: PendingChange) {
        self.in_flight_insert(pending.change.clone());
        let shared = self.clone();
        self.tracker.spawn(async move {
            let outcome = shared.execute_transfer(pending).await;
            shared.finish_transfer(outcome).await;
        });
    }

    async fn execute_transfer(&self, pending: PendingChange) -> TransferOutcome {
        let PendingChange { change, stream } = pending;
        let pool = self.pools.for_direction(change.direction);
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return TransferOutcome::Cancelled(change),
            permit = pool.acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return TransferOutcome::Cancelled(change);
        };
        if self.cancel.is_cancelled() {
            return TransferOutcome::Cancelled(change);
        }

        self.status.send(StatusEvent::TransferStarted {
            event_id: change.event_id,
            path: change.new_path.clone(),
            direction: change.direction,
            bytes_total: change.metadata.size,
        });

        let result = match change.direction {
            Direction::ToServer => self.upload(&change, stream).await,
            Direction::FromServer => self.download_into_place(&change).await,
        };
        match result {
            Ok(()) => TransferOutcome::Done(change),
            Err(err) if err.is_cancelled() => TransferOutcome::Cancelled(change),
            Err(err) => TransferOutcome::Failed(change, err),
        }
    }

    async fn upload(
        &self,
        change: &Change,
        stream: Option<UploadStream>,
    ) -> Result<(), TransportError> {
        let stream = match stream {
            Some(stream) => stream,
            None => {
                let local = local_path_for(&self.config.sync_root, &change.new_path)
                    .map_err(|err| TransportError::other(err.to_string()))?;
                UploadStream::open(&local).await.map_err(|err| {
                    if err.kind() == io::ErrorKind::NotFound {
                        TransportError::not_found(format!("{}: {err}", change.new_path))
                    } else {
                        TransportError::from(err)
                    }
                })?
            }
        };
        let progress = self.status.progress_callback(change.event_id);
        self.transport.upload(stream, change, progress).await
    }

    async fn download_into_place(&self, change: &Change) -> Result<(), TransportError> {
        let target = local_path_for(&self.config.sync_root, &change.new_path)
            .map_err(|err| TransportError::other(err.to_string()))?;
        let folder = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.sync_root.clone());

        match self
            .cache
            .claim(&folder, change.metadata.size, change.metadata.hash)
        {
            Claim::Leader(lease) => {
                let progress = self.status.progress_callback(change.event_id);
                if let Err(err) = self
                    .transport
                    .download(change, &lease.temp_path, progress)
                    .await
                {
                    self.cache.fail(&lease, &err.message).await;
                    return Err(err);
                }
                if let Err(err) = self
                    .move_into_place(change, &lease.temp_path, &target)
                    .await
                {
                    self.cache.fail(&lease, &err.message).await;
                    return Err(err);
                }
                self.cache.finish(&lease, &target).await;
                Ok(())
            }
            Claim::Follower(copy) => {
                debug!(path = %change.new_path, "waiting for identical download");
                let copy = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(TransportError::cancelled()),
                    copy = copy => copy,
                };
                let temp = match copy {
                    Ok(Ok(temp)) => temp,
                    Ok(Err(reason)) => return Err(TransportError::other(reason)),
                    Err(_) => return Err(TransportError::other("shared download abandoned")),
                };
                self.move_into_place(change, &temp, &target).await
            }
            Claim::Ready(temp) => self.move_into_place(change, &temp, &target).await,
        }
    }

    async fn move_into_place(
        &self,
        change: &Change,
        temp: &Path,
        target: &Path,
    ) -> Result<(), TransportError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.echo.suppress(&change.new_path);
        tokio::fs::rename(temp, target).await?;
        Ok(())
    }

    async fn finish_transfer(&self, outcome: TransferOutcome) {
        let (change, failure) = match outcome {
            TransferOutcome::Cancelled(change) => {
                self.in_flight_remove(change.event_id);
                self.status.send(StatusEvent::TransferFinished {
                    event_id: change.event_id,
                });
                debug!(event_id = change.event_id, path = %change.new_path, "transfer cancelled");
                return;
            }
            TransferOutcome::Done(change) => (change, None),
            TransferOutcome::Failed(change, err) => (change, Some(err)),
        };
        self.in_flight_remove(change.event_id);
        self.status.send(StatusEvent::TransferFinished {
            event_id: change.event_id,
        });

        match failure {
            None => self.transfer_succeeded(change).await,
            Some(err) => self.transfer_failed(change, err).await,
        }
    }

    async fn transfer_succeeded(&self, mut change: Change) {
        self.record_health(Channel::Transfer, cumulus_core::CallStatus::Success);
        let dependents = change.take_dependencies();
        if !dependents.is_empty() {
            self.release_dependents(dependents).await;
            let _ = self.trigger.send(RunTrigger::ShortRetry);
        }
        if let Err(err) = self.source.complete_change(change.event_id).await {
            warn!(event_id = change.event_id, path = %change.new_path, "failed to complete transfer: {err}");
        }
        let counter = match change.direction {
            Direction::ToServer => Counter::Uploaded,
            Direction::FromServer => Counter::Downloaded,
        };
        self.sink.increment(counter);
        self.sink.path_state(&change.new_path, PathState::Synced);
        info!(event_id = change.event_id, path = %change.new_path, "transfer finished");
    }

    async fn transfer_failed(&self, mut change: Change, err: TransportError) {
        self.record_health(Channel::Transfer, err.status);
        warn!(event_id = change.event_id, path = %change.new_path, "transfer failed: {err}");
        if err.is_not_found() {
            change.not_found_counter = change.not_found_counter.saturating_add(1);
        }
        let path = change.new_path.clone();
        if self.requeue_failure(change, false).await.is_serious() {
            self.sink.message(
                MessageLevel::Important,
                &format!("Giving up on {path} for now: {err}"),
            );
        }
    }
}
