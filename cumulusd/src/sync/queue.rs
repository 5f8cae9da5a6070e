use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::change::Change;

/// Sent to whoever drives the engine when a retry timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    ShortRetry,
    LongRetry,
}

#[derive(Debug, Default)]
struct ShortState {
    items: VecDeque<Option<Change>>,
    timer: Option<JoinHandle<()>>,
    disarmed: bool,
}

/// FIFO of changes waiting for the next run. `None` entries are forced-poll
/// markers. Enqueueing arms a one-shot timer that asks for a run after the
/// configured interval.
#[derive(Debug)]
pub struct RetryQueue {
    interval: Duration,
    trigger: UnboundedSender<RunTrigger>,
    state: Mutex<ShortState>,
}

impl RetryQueue {
    pub fn new(interval: Duration, trigger: UnboundedSender<RunTrigger>) -> Self {
        Self {
            interval,
            trigger,
            state: Mutex::new(ShortState::default()),
        }
    }

    pub fn enqueue(&self, item: Option<Change>) {
        let mut state = self.lock();
        state.items.push_back(item);
        self.arm(&mut state);
    }

    pub fn enqueue_all(&self, changes: impl IntoIterator<Item = Change>) {
        let mut state = self.lock();
        let before = state.items.len();
        state.items.extend(changes.into_iter().map(Some));
        if state.items.len() > before {
            self.arm(&mut state);
        }
    }

    /// Takes every queued entry and cancels the pending timer.
    pub fn drain(&self) -> Vec<Option<Change>> {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.items.drain(..).collect()
    }

    pub fn find_by_path(&self, path: &str) -> Option<Change> {
        self.lock()
            .items
            .iter()
            .flatten()
            .find(|change| change.new_path == path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops timers for good; queued entries stay for inspection.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.disarmed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, state: &mut ShortState) {
        if state.disarmed {
            return;
        }
        if state.timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let interval = self.interval;
        let trigger = self.trigger.clone();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = trigger.send(RunTrigger::ShortRetry);
        }));
    }

    fn lock(&self) -> MutexGuard<'_, ShortState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    items: Vec<(Instant, Change)>,
    timer: Option<JoinHandle<()>>,
    disarmed: bool,
}

/// Unordered holding area for changes that used up their short retries.
/// Each entry becomes due one long interval after it was added.
#[derive(Debug)]
pub struct LongRetryPool {
    interval: Option<Duration>,
    trigger: UnboundedSender<RunTrigger>,
    state: Arc<Mutex<PoolState>>,
}

impl LongRetryPool {
    /// `interval == None` disables the pool.
    pub fn new(interval: Option<Duration>, trigger: UnboundedSender<RunTrigger>) -> Self {
        Self {
            interval,
            trigger,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Returns `false` when the pool is disabled and the change was dropped.
    pub fn add(&self, mut change: Change) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        change.reset_counters();
        let mut state = lock_pool(&self.state);
        state.items.push((Instant::now(), change));
        self.arm(&mut state, interval);
        true
    }

    pub fn take_due(&self) -> Vec<Change> {
        let Some(interval) = self.interval else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut state = lock_pool(&self.state);
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
            .into_iter()
            .partition(|(added, _)| *added + interval <= now);
        state.items = waiting;
        if !state.items.is_empty() {
            self.arm(&mut state, interval);
        }
        due.into_iter().map(|(_, change)| change).collect()
    }

    pub fn len(&self) -> usize {
        lock_pool(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut state = lock_pool(&self.state);
        state.disarmed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, state: &mut PoolState, interval: Duration) {
        if state.disarmed {
            return;
        }
        if state.timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }
        let Some(earliest) = state.items.iter().map(|(added, _)| *added).min() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let trigger = self.trigger.clone();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(earliest + interval).await;
            let _ = trigger.send(RunTrigger::LongRetry);
        }));
    }
}

fn lock_pool(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
