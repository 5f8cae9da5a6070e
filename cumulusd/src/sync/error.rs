use thiserror::Error;

use super::change::PendingChange;
use super::engine::RunPhase;
use super::paths::PathError;
use super::policy::HaltReason;
use super::source::SourceError;
use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("engine halted: {0}")]
    Halted(HaltReason),
    #[error("run cancelled by shutdown")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("change source error: {0}")]
    Source(#[from] SourceError),
    #[error("failed to merge results during {phase}: {source}")]
    Merge {
        phase: RunPhase,
        #[source]
        source: SourceError,
    },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("{path}: {reason}")]
    Change { path: String, reason: String },
    #[error(
        "{} error(s) during sync run, last phase {phase}: {}",
        .errors.len(),
        .errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Aggregate {
        phase: RunPhase,
        errors: Vec<SyncError>,
    },
}

impl SyncError {
    pub fn change(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Change {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Transport(err) => err.is_cancelled(),
            _ => false,
        }
    }

    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            SyncError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Result of one unit of per-change work.
#[derive(Debug)]
pub enum Step<T> {
    Done(T),
    /// The change failed and goes back through the retry policy.
    Retry(PendingChange, SyncError),
    /// Stop the run.
    Fatal(SyncError),
}

impl<T> Step<T> {
    pub fn retry(pending: impl Into<PendingChange>, err: impl Into<SyncError>) -> Self {
        Step::Retry(pending.into(), err.into())
    }
}
