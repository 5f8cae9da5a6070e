//! Folds per-transfer progress and engine state into one [`SyncStatus`].
//!
//! Updates are applied to the snapshot as they arrive; a lazily spawned
//! worker publishes the snapshot to the notification sink, prunes finished
//! transfers and exits after an idle period.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::bus::NotificationSink;
use super::change::{Direction, EventId};
use super::policy::HaltReason;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub communicating: bool,
    pub uploading: bool,
    pub downloading: bool,
    pub halted_on_connection_failure: bool,
    pub halted_on_expired_credentials: bool,
}

impl StatusFlags {
    pub fn is_idle(&self) -> bool {
        *self == StatusFlags::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub event_id: EventId,
    pub path: String,
    pub direction: Direction,
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub finished_at: Option<Instant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub flags: StatusFlags,
    pub transfers: Vec<TransferProgress>,
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    Communicating(bool),
    TransferStarted {
        event_id: EventId,
        path: String,
        direction: Direction,
        bytes_total: Option<u64>,
    },
    TransferProgress {
        event_id: EventId,
        bytes_done: u64,
    },
    TransferFinished {
        event_id: EventId,
    },
    Halted(HaltReason),
}

#[derive(Debug)]
struct WorkerSlot {
    running: bool,
    dirty: bool,
}

pub struct StatusAggregator {
    sink: Arc<dyn NotificationSink>,
    idle_timeout: Duration,
    prune_after: Duration,
    snapshot: Arc<Mutex<SyncStatus>>,
    slot: Arc<Mutex<WorkerSlot>>,
    wake: Arc<Notify>,
}

impl StatusAggregator {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_timings(sink, Duration::from_secs(30), Duration::from_secs(5))
    }

    pub fn with_timings(
        sink: Arc<dyn NotificationSink>,
        idle_timeout: Duration,
        prune_after: Duration,
    ) -> Self {
        Self {
            sink,
            idle_timeout,
            prune_after,
            snapshot: Arc::new(Mutex::new(SyncStatus::default())),
            slot: Arc::new(Mutex::new(WorkerSlot {
                running: false,
                dirty: false,
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn current(&self) -> SyncStatus {
        lock(&self.snapshot).clone()
    }

    pub fn send(&self, event: StatusEvent) {
        apply(&mut lock(&self.snapshot), event);
        let mut slot = lock(&self.slot);
        slot.dirty = true;
        if !slot.running {
            if tokio::runtime::Handle::try_current().is_err() {
                return;
            }
            slot.running = true;
            tokio::spawn(worker(
                self.sink.clone(),
                self.snapshot.clone(),
                self.slot.clone(),
                self.wake.clone(),
                self.idle_timeout,
                self.prune_after,
            ));
        }
        drop(slot);
        self.wake.notify_one();
    }

    pub fn progress_callback(
        self: &Arc<Self>,
        event_id: EventId,
    ) -> Arc<dyn Fn(u64) + Send + Sync> {
        let aggregator = Arc::downgrade(self);
        Arc::new(move |bytes_done| {
            if let Some(aggregator) = aggregator.upgrade() {
                aggregator.send(StatusEvent::TransferProgress {
                    event_id,
                    bytes_done,
                });
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn apply(status: &mut SyncStatus, event: StatusEvent) {
    match event {
        StatusEvent::Communicating(value) => status.flags.communicating = value,
        StatusEvent::TransferStarted {
            event_id,
            path,
            direction,
            bytes_total,
        } => {
            status.transfers.retain(|t| t.event_id != event_id);
            status.transfers.push(TransferProgress {
                event_id,
                path,
                direction,
                bytes_total,
                bytes_done: 0,
                finished_at: None,
            });
        }
        StatusEvent::TransferProgress {
            event_id,
            bytes_done,
        } => {
            if let Some(transfer) = status
                .transfers
                .iter_mut()
                .find(|t| t.event_id == event_id && t.finished_at.is_none())
            {
                transfer.bytes_done = bytes_done;
            }
        }
        StatusEvent::TransferFinished { event_id } => {
            for transfer in status
                .transfers
                .iter_mut()
                .filter(|t| t.event_id == event_id && t.finished_at.is_none())
            {
                transfer.finished_at = Some(Instant::now());
            }
        }
        StatusEvent::Halted(reason) => match reason {
            HaltReason::ConnectionFailures(_) => status.flags.halted_on_connection_failure = true,
            HaltReason::ExpiredCredentials | HaltReason::NotAuthorized => {
                status.flags.halted_on_expired_credentials = true
            }
        },
    }
    refresh_transfer_flags(status);
}

fn refresh_transfer_flags(status: &mut SyncStatus) {
    let active = |direction| {
        status
            .transfers
            .iter()
            .any(|t| t.direction == direction && t.finished_at.is_none())
    };
    status.flags.uploading = active(Direction::ToServer);
    status.flags.downloading = active(Direction::FromServer);
}

fn prune(status: &mut SyncStatus, older_than: Duration) -> bool {
    let now = Instant::now();
    let before = status.transfers.len();
    status
        .transfers
        .retain(|t| t.finished_at.is_none_or(|at| now.duration_since(at) < older_than));
    before != status.transfers.len()
}

async fn worker(
    sink: Arc<dyn NotificationSink>,
    snapshot: Arc<Mutex<SyncStatus>>,
    slot: Arc<Mutex<WorkerSlot>>,
    wake: Arc<Notify>,
    idle_timeout: Duration,
    prune_after: Duration,
) {
    let tick = prune_after.min(idle_timeout);
    let mut last_activity = Instant::now();
    loop {
        let woke = tokio::time::timeout(tick, wake.notified()).await.is_ok();
        if woke {
            last_activity = Instant::now();
        }

        let pruned = prune(&mut lock(&snapshot), prune_after);
        let publish = {
            let mut slot = lock(&slot);
            std::mem::replace(&mut slot.dirty, false) || pruned
        };
        if publish {
            let status = lock(&snapshot).clone();
            sink.status(&status);
        }

        if last_activity.elapsed() >= idle_timeout {
            let mut slot = lock(&slot);
            if slot.dirty {
                continue;
            }
            slot.running = false;
            debug!("status worker idle, exiting");
            return;
        }
    }
}
