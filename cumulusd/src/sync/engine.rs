use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cumulus_core::CallStatus;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::bus::{MessageLevel, NotificationSink};
use super::change::{Change, EventId};
use super::download_cache::DownloadCache;
use super::error::SyncError;
use super::local_watcher::EchoFilter;
use super::policy::{Channel, HealthChange, HealthMonitor, RetryDecision, RetryLimits};
use super::queue::{LongRetryPool, RetryQueue, RunTrigger};
use super::source::{ChangeSource, MergeItem};
use super::status::{StatusAggregator, StatusEvent, SyncStatus};
use super::transfer::{TransferConfig, TransferPools};
use super::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sync_root: PathBuf,
    /// Appears in conflict copies and identifies this client to the service.
    pub device_name: String,
    pub limits: RetryLimits,
    pub retry_interval: Duration,
    /// `None` disables the long retry pool.
    pub long_retry_interval: Option<Duration>,
    pub transfer: TransferConfig,
    pub max_connection_failures: u8,
}

impl EngineConfig {
    pub fn new(sync_root: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            sync_root: sync_root.into(),
            device_name: device_name.into(),
            limits: RetryLimits::default(),
            retry_interval: Duration::from_secs(5),
            long_retry_interval: Some(Duration::from_secs(600)),
            transfer: TransferConfig::default(),
            max_connection_failures: 3,
        }
    }
}

/// Steps of one sync run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Locked,
    HaltCheck,
    ConnectivityCheck,
    DrainShortQueue,
    GrabNewChanges,
    Preprocess,
    BuildCommunicationBatch,
    Communicate,
    MergeResults,
    ReassignDependencies,
    DispatchAsyncTransfers,
    RequeueFailures,
    Unlocked,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunPhase::Locked => "locked",
            RunPhase::HaltCheck => "halt check",
            RunPhase::ConnectivityCheck => "connectivity check",
            RunPhase::DrainShortQueue => "drain short queue",
            RunPhase::GrabNewChanges => "grab new changes",
            RunPhase::Preprocess => "preprocess",
            RunPhase::BuildCommunicationBatch => "build communication batch",
            RunPhase::Communicate => "communicate",
            RunPhase::MergeResults => "merge results",
            RunPhase::ReassignDependencies => "reassign dependencies",
            RunPhase::DispatchAsyncTransfers => "dispatch transfers",
            RunPhase::RequeueFailures => "requeue failures",
            RunPhase::Unlocked => "unlocked",
        };
        f.write_str(label)
    }
}

/// Counts from one run, mostly for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub grabbed: usize,
    pub completed: usize,
    pub communicated: usize,
    pub server_changes: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub cursor: Option<String>,
}

/// Where a failed change ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Requeued {
    Retried,
    Cancelled,
    LongPool,
    Abandoned,
}

impl Requeued {
    pub fn is_serious(self) -> bool {
        matches!(self, Requeued::LongPool | Requeued::Abandoned)
    }
}

/// State shared between the run loop and the transfer tasks it spawns.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub source: Arc<dyn ChangeSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub short_queue: RetryQueue,
    pub long_pool: LongRetryPool,
    pub health: HealthMonitor,
    pub status: Arc<StatusAggregator>,
    pub cache: DownloadCache,
    pub pools: TransferPools,
    in_flight: Mutex<HashMap<EventId, Change>>,
    pub tracker: TaskTracker,
    pub cancel: CancellationToken,
    pub echo: Arc<EchoFilter>,
    pub trigger: UnboundedSender<RunTrigger>,
    pub initial_run: AtomicBool,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<EventId, Change>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn in_flight_insert(&self, change: Change) {
        self.in_flight().insert(change.event_id, change);
    }

    pub(crate) fn in_flight_remove(&self, event_id: EventId) {
        self.in_flight().remove(&event_id);
    }

    pub(crate) fn in_flight_contains(&self, event_id: EventId) -> bool {
        self.in_flight().contains_key(&event_id)
    }

    pub(crate) fn in_flight_find_by_path(&self, path: &str) -> Option<Change> {
        self.in_flight()
            .values()
            .find(|change| change.new_path == path)
            .cloned()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight().len()
    }

    pub(crate) fn record_health(&self, channel: Channel, status: CallStatus) {
        match self.health.record(channel, status) {
            HealthChange::Unchanged => {}
            HealthChange::Recovered => debug!(%channel, "connection recovered"),
            HealthChange::Halted(reason) => {
                error!(%channel, "sync halted: {reason}");
                self.status.send(StatusEvent::Halted(reason));
                self.sink.message(
                    MessageLevel::Important,
                    &format!("Synchronization stopped: {reason}"),
                );
            }
        }
    }

    /// Feeds the outcome of a call into the health counters and passes it on.
    pub(crate) fn observe<T>(
        &self,
        channel: Channel,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        match &result {
            Ok(_) => self.record_health(channel, CallStatus::Success),
            Err(err) => self.record_health(channel, err.status),
        }
        result
    }

    /// Hands dependents back to the change source as front-of-line work.
    pub(crate) async fn release_dependents(&self, dependents: Vec<Change>) {
        if dependents.is_empty() {
            return;
        }
        let fallback = dependents.clone();
        match self.source.enqueue_new_changes(dependents, true).await {
            Ok(failed) if failed.is_empty() => {}
            Ok(failed) => {
                warn!(count = failed.len(), "keeping unpersisted dependents in memory");
                self.short_queue.enqueue_all(failed);
            }
            Err(err) => {
                warn!("failed to release dependents: {err}");
                self.short_queue.enqueue_all(fallback);
            }
        }
    }

    pub(crate) async fn requeue_failure(&self, change: Change, already_counted: bool) -> Requeued {
        let decision =
            self.config
                .limits
                .should_retry(change, already_counted, self.sink.as_ref());
        match decision {
            RetryDecision::Retry(change) => {
                self.short_queue.enqueue(Some(change));
                Requeued::Retried
            }
            RetryDecision::Cancelled { change, freed } => {
                info!(event_id = change.event_id, path = %change.new_path, "dropping change the server keeps missing");
                if change.event_id > 0
                    && let Err(err) = self
                        .source
                        .merge_to_persistent_store(MergeItem::Remove(change.event_id))
                        .await
                {
                    warn!(event_id = change.event_id, "failed to remove cancelled change: {err}");
                }
                self.release_dependents(freed).await;
                Requeued::Cancelled
            }
            RetryDecision::FailedOut(change) => {
                let event_id = change.event_id;
                let path = change.new_path.clone();
                if self.long_pool.add(change) {
                    info!(event_id, path = %path, "moved to the long retry pool");
                    Requeued::LongPool
                } else {
                    warn!(event_id, path = %path, "giving up on change");
                    Requeued::Abandoned
                }
            }
        }
    }
}

/// Reconciles local and remote state one run at a time. Runs never overlap;
/// transfers started by a run continue in the background.
pub struct SyncEngine {
    pub(crate) shared: Arc<Shared>,
    run_lock: tokio::sync::Mutex<()>,
    triggers: Mutex<Option<UnboundedReceiver<RunTrigger>>>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let (trigger, triggers) = mpsc::unbounded_channel();
        let cache = DownloadCache::new(&config.sync_root)?;
        let shared = Shared {
            short_queue: RetryQueue::new(config.retry_interval, trigger.clone()),
            long_pool: LongRetryPool::new(config.long_retry_interval, trigger.clone()),
            health: HealthMonitor::new(config.max_connection_failures),
            status: Arc::new(StatusAggregator::new(sink.clone())),
            pools: TransferPools::new(config.transfer),
            cache,
            in_flight: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            echo: Arc::new(EchoFilter::default()),
            initial_run: AtomicBool::new(true),
            config,
            transport,
            source,
            sink,
            cancel,
            trigger,
        };
        Ok(Self {
            shared: Arc::new(shared),
            run_lock: tokio::sync::Mutex::new(()),
            triggers: Mutex::new(Some(triggers)),
        })
    }

    /// Performs one run. `responding_to_push` forces a pull even when local
    /// changes are waiting.
    pub async fn run(&self, responding_to_push: bool) -> Result<RunSummary, SyncError> {
        let _guard = self.run_lock.lock().await;
        debug!(phase = %RunPhase::Locked, responding_to_push, "sync run started");
        let result = super::engine_run::drive(&self.shared, responding_to_push).await;
        debug!(phase = %RunPhase::Unlocked, "sync run finished");
        result
    }

    pub fn current_status(&self) -> SyncStatus {
        self.shared.status.current()
    }

    /// Asks the next run to pull even without local changes.
    pub fn request_poll(&self) {
        self.shared.short_queue.enqueue(None);
    }

    /// Receiver of retry timer wake-ups. Only the first caller gets it.
    pub fn take_trigger_receiver(&self) -> Option<UnboundedReceiver<RunTrigger>> {
        self.triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Suppression list for watcher events caused by the engine itself.
    pub fn echo_filter(&self) -> Arc<EchoFilter> {
        self.shared.echo.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.health.halt_reason().is_some()
    }

    /// Consecutive connection failures on the worse of the two channels.
    pub fn connection_failures(&self) -> u8 {
        self.shared
            .health
            .failures(Channel::Metadata)
            .max(self.shared.health.failures(Channel::Transfer))
    }

    pub fn transfers_in_flight(&self) -> usize {
        self.shared.in_flight_len()
    }

    /// Waits until every spawned transfer finished. Intended for one-shot
    /// runs and tests; new transfers may be spawned afterwards.
    pub async fn wait_for_transfers(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.tracker.reopen();
    }

    /// Stops everything. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() && self.shared.tracker.is_closed() {
            return;
        }
        info!("sync engine shutting down");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.short_queue.shutdown();
        self.shared.long_pool.shutdown();
        self.shared.cache.clear();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
