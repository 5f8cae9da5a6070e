//! Retry and halt decisions.
//!
//! Per-change failures climb two budgets: a failure count and a not-found
//! count. Connection health is tracked per channel and, together with
//! credential rejections, can halt the engine until the process restarts.

use std::fmt;
use std::sync::Mutex;

use cumulus_core::CallStatus;

use super::bus::{NotificationSink, PathState};
use super::change::Change;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub max_failure_retries: u32,
    pub max_not_founds: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_failure_retries: 20,
            max_not_founds: 10,
        }
    }
}

#[derive(Debug)]
pub enum RetryDecision {
    /// Back into the short retry queue.
    Retry(Change),
    /// Not-found budget exhausted: the change is treated as cancelled and its
    /// dependents become top-level work again.
    Cancelled { change: Change, freed: Vec<Change> },
    /// Failure budget exhausted: the change and every dependent were badged
    /// failed. Counters are reset; dependents stay attached.
    FailedOut(Change),
}

impl RetryLimits {
    pub fn should_retry(
        &self,
        mut change: Change,
        already_counted: bool,
        sink: &dyn NotificationSink,
    ) -> RetryDecision {
        if already_counted {
            return RetryDecision::Retry(change);
        }

        change.failure_counter = change.failure_counter.saturating_add(1);
        if change.failure_counter == 1 {
            sink.path_state(&change.new_path, PathState::Failed);
        }

        if change.failure_counter < self.max_failure_retries
            && change.not_found_counter < self.max_not_founds
        {
            return RetryDecision::Retry(change);
        }

        // Both budgets can run out together; not-found wins so the change is
        // dropped quietly instead of being parked in the long pool.
        if change.not_found_counter >= self.max_not_founds {
            sink.path_state(&change.new_path, PathState::None);
            let mut freed = change.take_dependencies();
            for dependency in &mut freed {
                dependency.not_found_counter = 0;
            }
            return RetryDecision::Cancelled { change, freed };
        }

        sink.path_state(&change.new_path, PathState::Failed);
        for dependency in change.flatten_dependencies() {
            sink.path_state(&dependency.new_path, PathState::Failed);
        }
        change.reset_counters();
        RetryDecision::FailedOut(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Metadata,
    Transfer,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Metadata => f.write_str("metadata"),
            Channel::Transfer => f.write_str("transfer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    ConnectionFailures(Channel),
    ExpiredCredentials,
    NotAuthorized,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::ConnectionFailures(channel) => {
                write!(f, "too many connection failures on the {channel} channel")
            }
            HaltReason::ExpiredCredentials => f.write_str("credentials expired"),
            HaltReason::NotAuthorized => f.write_str("credentials rejected"),
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    metadata_failures: u8,
    transfer_failures: u8,
    connection_halt: Option<Channel>,
    credential_halt: Option<HaltReason>,
}

/// Consecutive connection failure counters plus the permanent halt flags.
#[derive(Debug)]
pub struct HealthMonitor {
    max_connection_failures: u8,
    state: Mutex<HealthState>,
}

/// What a recorded outcome did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Unchanged,
    Recovered,
    Halted(HaltReason),
}

impl HealthMonitor {
    pub fn new(max_connection_failures: u8) -> Self {
        Self {
            max_connection_failures,
            state: Mutex::new(HealthState::default()),
        }
    }

    pub fn record(&self, channel: Channel, status: CallStatus) -> HealthChange {
        let mut state = self.lock();
        if state.connection_halt.is_some() || state.credential_halt.is_some() {
            return HealthChange::Unchanged;
        }
        let counter = match channel {
            Channel::Metadata => &mut state.metadata_failures,
            Channel::Transfer => &mut state.transfer_failures,
        };
        match status {
            CallStatus::ConnectionFailed => {
                *counter = counter.saturating_add(1);
                if *counter > self.max_connection_failures {
                    state.connection_halt = Some(channel);
                    return HealthChange::Halted(HaltReason::ConnectionFailures(channel));
                }
                HealthChange::Unchanged
            }
            CallStatus::ExpiredCredentials => {
                state.credential_halt = Some(HaltReason::ExpiredCredentials);
                HealthChange::Halted(HaltReason::ExpiredCredentials)
            }
            CallStatus::NotAuthorized => {
                state.credential_halt = Some(HaltReason::NotAuthorized);
                HealthChange::Halted(HaltReason::NotAuthorized)
            }
            // A cancelled call says nothing about the connection.
            CallStatus::Cancelled => HealthChange::Unchanged,
            CallStatus::Success | CallStatus::NoContent | CallStatus::Other => {
                let recovered = *counter > 0;
                *counter = 0;
                if recovered {
                    HealthChange::Recovered
                } else {
                    HealthChange::Unchanged
                }
            }
        }
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        let state = self.lock();
        state
            .credential_halt
            .or(state.connection_halt.map(HaltReason::ConnectionFailures))
    }

    pub fn connection_halted(&self) -> bool {
        self.lock().connection_halt.is_some()
    }

    pub fn credentials_expired(&self) -> bool {
        self.lock().credential_halt == Some(HaltReason::ExpiredCredentials)
    }

    pub fn failures(&self, channel: Channel) -> u8 {
        let state = self.lock();
        match channel {
            Channel::Metadata => state.metadata_failures,
            Channel::Transfer => state.transfer_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
