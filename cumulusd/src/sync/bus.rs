use tracing::{info, warn};

use super::status::SyncStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Important,
}

/// Badge shown next to a path in file managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Failed,
    Synced,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Uploaded,
    Downloaded,
}

/// Receiver of everything the engine wants the outside world to see.
pub trait NotificationSink: Send + Sync {
    fn message(&self, level: MessageLevel, text: &str);
    fn path_state(&self, path: &str, state: PathState);
    fn increment(&self, counter: Counter);
    fn status(&self, status: &SyncStatus);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn message(&self, level: MessageLevel, text: &str) {
        match level {
            MessageLevel::Info => info!(target: "cumulusd::bus", "{text}"),
            MessageLevel::Important => warn!(target: "cumulusd::bus", "{text}"),
        }
    }

    fn path_state(&self, path: &str, state: PathState) {
        info!(target: "cumulusd::bus", path, ?state, "path state");
    }

    fn increment(&self, counter: Counter) {
        info!(target: "cumulusd::bus", ?counter, "transfer counted");
    }

    fn status(&self, status: &SyncStatus) {
        tracing::debug!(
            target: "cumulusd::bus",
            flags = ?status.flags,
            transfers = status.transfers.len(),
            "status changed"
        );
    }
}
