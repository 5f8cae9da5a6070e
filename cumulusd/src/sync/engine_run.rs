//! The run state machine. Each phase function does its work on the run
//! context and names the phase that follows.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use cumulus_core::DEFAULT_SYNC_ID;
use tracing::{debug, info, warn};

use super::bus::{MessageLevel, PathState};
use super::change::{Change, Direction, EventId, PendingChange};
use super::engine::{RunPhase, RunSummary, Shared};
use super::engine_apply::{Disposition, preprocess_one};
use super::error::{Step, SyncError};
use super::paths::local_path_for;
use super::protocol::{self, Exchange};
use super::queue::RunTrigger;
use super::source::MergeItem;
use super::status::StatusEvent;
use super::transfer::UploadStream;

struct RunContext {
    responding_to_push: bool,
    forced_poll: bool,
    phase: RunPhase,
    error_phase: Option<RunPhase>,
    prior: Vec<Change>,
    work: Vec<Change>,
    to_communicate: Vec<Change>,
    batch: Vec<PendingChange>,
    exchange: Option<Exchange>,
    incomplete: Vec<PendingChange>,
    server_changes: Vec<Change>,
    dispatch: Vec<Change>,
    transfers: Vec<PendingChange>,
    streams: HashMap<EventId, UploadStream>,
    /// Failed in this run; counted against the retry budget.
    failed: Vec<(PendingChange, SyncError)>,
    /// Not attempted or not at fault; retried without counting.
    carried: Vec<Change>,
    /// Storage keys the server still waits for, fetched once per run.
    pending_uploads: Option<HashSet<String>>,
    errors: Vec<SyncError>,
    summary: RunSummary,
}

impl RunContext {
    fn new(responding_to_push: bool) -> Self {
        Self {
            responding_to_push,
            forced_poll: false,
            phase: RunPhase::Locked,
            error_phase: None,
            prior: Vec::new(),
            work: Vec::new(),
            to_communicate: Vec::new(),
            batch: Vec::new(),
            exchange: None,
            incomplete: Vec::new(),
            server_changes: Vec::new(),
            dispatch: Vec::new(),
            transfers: Vec::new(),
            streams: HashMap::new(),
            failed: Vec::new(),
            carried: Vec::new(),
            pending_uploads: None,
            errors: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    fn fail(&mut self, err: SyncError) {
        warn!(phase = %self.phase, "sync run error: {err}");
        self.error_phase = Some(self.phase);
        self.errors.push(err);
    }

    fn carry_pending(&mut self, pending: impl IntoIterator<Item = PendingChange>) {
        self.carried
            .extend(pending.into_iter().map(|pending| pending.change));
    }

    /// Work a jump to requeueing skipped over.
    fn take_unfinished(&mut self) -> Vec<Change> {
        let mut out = mem::take(&mut self.work);
        out.append(&mut self.to_communicate);
        out.append(&mut self.server_changes);
        out.append(&mut self.dispatch);
        let pending = mem::take(&mut self.batch)
            .into_iter()
            .chain(mem::take(&mut self.incomplete))
            .chain(mem::take(&mut self.transfers));
        out.extend(pending.map(|pending| pending.change));
        out
    }

    fn finish(mut self) -> Result<RunSummary, SyncError> {
        match self.errors.len() {
            0 => Ok(self.summary),
            1 => Err(self.errors.remove(0)),
            _ => Err(SyncError::Aggregate {
                phase: self.error_phase.unwrap_or(self.phase),
                errors: self.errors,
            }),
        }
    }
}

pub(crate) async fn drive(
    shared: &Arc<Shared>,
    responding_to_push: bool,
) -> Result<RunSummary, SyncError> {
    let mut ctx = RunContext::new(responding_to_push);
    let mut phase = RunPhase::Locked;
    while phase != RunPhase::Unlocked {
        ctx.phase = phase;
        debug!(phase = %phase, "entering run phase");
        phase = match phase {
            RunPhase::Locked => RunPhase::HaltCheck,
            RunPhase::HaltCheck => halt_check(shared, &mut ctx),
            RunPhase::ConnectivityCheck => connectivity_check(shared).await,
            RunPhase::DrainShortQueue => drain_short_queue(shared, &mut ctx),
            RunPhase::GrabNewChanges => grab_new_changes(shared, &mut ctx).await,
            RunPhase::Preprocess => preprocess(shared, &mut ctx).await,
            RunPhase::BuildCommunicationBatch => build_batch(shared, &mut ctx).await,
            RunPhase::Communicate => communicate(shared, &mut ctx).await,
            RunPhase::MergeResults => merge_results(shared, &mut ctx).await,
            RunPhase::ReassignDependencies => reassign_dependencies(shared, &mut ctx).await,
            RunPhase::DispatchAsyncTransfers => dispatch_transfers(shared, &mut ctx).await,
            RunPhase::RequeueFailures => requeue_failures(shared, &mut ctx).await,
            RunPhase::Unlocked => RunPhase::Unlocked,
        };
    }
    // The first-run shortcuts stay on until one exchange made it to disk.
    if ctx.summary.cursor.is_some() {
        shared.initial_run.store(false, Ordering::SeqCst);
    }
    ctx.finish()
}

fn halt_check(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    match shared.health.halt_reason() {
        Some(reason) => {
            ctx.fail(SyncError::Halted(reason));
            RunPhase::Unlocked
        }
        None => RunPhase::ConnectivityCheck,
    }
}

async fn connectivity_check(shared: &Shared) -> RunPhase {
    if shared.transport.is_reachable().await {
        RunPhase::DrainShortQueue
    } else {
        info!("sync service unreachable, skipping run");
        RunPhase::Unlocked
    }
}

fn drain_short_queue(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    for item in shared.short_queue.drain() {
        match item {
            Some(change) => ctx.prior.push(change),
            None => ctx.forced_poll = true,
        }
    }
    let due = shared.long_pool.take_due();
    if !due.is_empty() {
        info!(count = due.len(), "retrying changes from the long retry pool");
        ctx.prior.extend(due);
    }
    RunPhase::GrabNewChanges
}

async fn grab_new_changes(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    let prior = mem::take(&mut ctx.prior);
    let fallback = prior.clone();
    match shared.source.grab_pending_changes(prior).await {
        Ok(grabbed) => {
            if !grabbed.changes_in_error.is_empty() {
                warn!(
                    count = grabbed.changes_in_error.len(),
                    "some changes could not be persisted"
                );
            }
            ctx.carried.extend(grabbed.changes_in_error);
            ctx.summary.grabbed = grabbed.changes.len();
            ctx.work = grabbed.changes;
            RunPhase::Preprocess
        }
        Err(err) => {
            ctx.carried.extend(fallback);
            ctx.fail(err.into());
            RunPhase::RequeueFailures
        }
    }
}

async fn preprocess(shared: &Arc<Shared>, ctx: &mut RunContext) -> RunPhase {
    let work = mem::take(&mut ctx.work);
    match work_through(shared, ctx, work.into(), false).await {
        Ok(()) => RunPhase::BuildCommunicationBatch,
        Err(err) => {
            ctx.fail(err);
            RunPhase::RequeueFailures
        }
    }
}

/// Handles changes one at a time; completing one puts its dependents at the
/// front of the list. `after_exchange` marks uploads the server already
/// accepted in this run.
async fn work_through(
    shared: &Arc<Shared>,
    ctx: &mut RunContext,
    mut queue: VecDeque<Change>,
    after_exchange: bool,
) -> Result<(), SyncError> {
    while let Some(change) = queue.pop_front() {
        if shared.cancel.is_cancelled() {
            ctx.carried.push(change);
            ctx.carried.extend(queue);
            return Err(SyncError::Cancelled);
        }

        let step = if after_exchange && change.direction == Direction::ToServer {
            if change.is_transfer() {
                Step::Done(Disposition::Transfer(PendingChange::new(change)))
            } else {
                Step::Done(Disposition::Communicate(change))
            }
        } else {
            preprocess_one(shared, change, &mut ctx.pending_uploads).await
        };

        match step {
            Step::Done(Disposition::Completed(mut change)) => {
                for dependency in change.take_dependencies().into_iter().rev() {
                    queue.push_front(dependency);
                }
                if let Err(err) = shared.source.complete_change(change.event_id).await {
                    warn!(event_id = change.event_id, path = %change.new_path, "failed to record completion: {err}");
                }
                shared.sink.path_state(&change.new_path, PathState::Synced);
                ctx.summary.completed += 1;
            }
            Step::Done(Disposition::Transfer(pending)) => ctx.transfers.push(pending),
            Step::Done(Disposition::Communicate(change)) => ctx.to_communicate.push(change),
            Step::Retry(pending, err) => ctx.failed.push((pending, err)),
            Step::Fatal(err) => {
                ctx.carried.extend(queue);
                return Err(err);
            }
        }
    }
    Ok(())
}

async fn build_batch(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    for mut change in mem::take(&mut ctx.to_communicate) {
        if change.direction == Direction::FromServer {
            ctx.carried.push(change);
            continue;
        }
        if !change.is_transfer() {
            ctx.batch.push(PendingChange::new(change));
            continue;
        }
        let opened = match local_path_for(&shared.config.sync_root, &change.new_path) {
            Ok(local) => UploadStream::open(&local).await,
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
        };
        match opened {
            Ok(stream) => {
                change.metadata.size = Some(stream.len());
                change.metadata.hash = Some(stream.hash());
                ctx.batch.push(PendingChange::with_stream(change, stream));
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    change.not_found_counter = change.not_found_counter.saturating_add(1);
                }
                let err = SyncError::change(&change.new_path, format!("cannot read file: {err}"));
                ctx.failed.push((PendingChange::new(change), err));
            }
        }
    }
    RunPhase::Communicate
}

async fn communicate(shared: &Arc<Shared>, ctx: &mut RunContext) -> RunPhase {
    let cursor = match shared.source.last_cursor().await {
        Ok(cursor) => cursor,
        Err(err) => {
            let batch = mem::take(&mut ctx.batch);
            ctx.carry_pending(batch);
            ctx.fail(err.into());
            return RunPhase::RequeueFailures;
        }
    };
    let pull_requested =
        ctx.forced_poll || ctx.responding_to_push || cursor == DEFAULT_SYNC_ID;
    if ctx.batch.is_empty() && !pull_requested {
        return RunPhase::ReassignDependencies;
    }
    if shared.cancel.is_cancelled() {
        let batch = mem::take(&mut ctx.batch);
        ctx.carry_pending(batch);
        ctx.fail(SyncError::Cancelled);
        return RunPhase::RequeueFailures;
    }

    let batch = mem::take(&mut ctx.batch);
    ctx.summary.communicated = batch.len();
    shared.status.send(StatusEvent::Communicating(true));
    let exchange = protocol::communicate(
        shared,
        batch,
        cursor,
        pull_requested,
        ctx.responding_to_push,
    )
    .await;
    shared.status.send(StatusEvent::Communicating(false));
    ctx.exchange = Some(exchange);
    RunPhase::MergeResults
}

async fn merge_results(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    let Some(exchange) = ctx.exchange.take() else {
        return RunPhase::ReassignDependencies;
    };
    let Exchange {
        cursor,
        root_uid,
        mut completed,
        incomplete,
        errored,
        converted,
        server_changes,
        freed,
        fatal,
    } = exchange;
    ctx.carried.extend(converted);

    if let Some(err) = fatal {
        // Nothing from this exchange is trusted; the cursor stays put.
        ctx.carried.extend(freed);
        ctx.carried.extend(completed);
        ctx.carry_pending(incomplete);
        ctx.failed.extend(errored);
        ctx.fail(err);
        return RunPhase::RequeueFailures;
    }

    let mut applied = Vec::with_capacity(server_changes.len());
    for change in server_changes {
        match shared.source.apply_remote_change(change).await {
            Ok(change) => applied.push(change),
            Err(source) => {
                discard_applied(shared, applied).await;
                ctx.carried.extend(freed);
                ctx.carried.extend(completed);
                ctx.carry_pending(incomplete);
                ctx.failed.extend(errored);
                ctx.fail(SyncError::Merge {
                    phase: RunPhase::MergeResults,
                    source,
                });
                return RunPhase::RequeueFailures;
            }
        }
    }

    // Dependents stay on their parents until the completions are stored.
    let completed_ids: Vec<EventId> = completed.iter().map(|change| change.event_id).collect();
    let mut all_changes: Vec<Change> = completed.clone();
    all_changes.extend(incomplete.iter().map(|pending| pending.change.clone()));
    all_changes.extend(errored.iter().map(|(pending, _)| pending.change.clone()));
    if let Err(source) = shared
        .source
        .record_completed_cursor(&all_changes, &cursor, &completed_ids, root_uid.as_deref())
        .await
    {
        discard_applied(shared, applied).await;
        ctx.carried.extend(freed);
        ctx.carried.extend(completed);
        ctx.carry_pending(incomplete);
        ctx.failed.extend(errored);
        ctx.fail(SyncError::Merge {
            phase: RunPhase::MergeResults,
            source,
        });
        return RunPhase::RequeueFailures;
    }

    let mut released = freed;
    for change in &mut completed {
        for dependency in change.take_dependencies() {
            match dependency.direction {
                Direction::ToServer => released.push(dependency),
                Direction::FromServer => ctx.dispatch.push(dependency),
            }
        }
    }
    if !released.is_empty() {
        shared.release_dependents(released).await;
        let _ = shared.trigger.send(RunTrigger::ShortRetry);
    }
    info!(
        cursor = %cursor,
        completed = completed.len(),
        incomplete = incomplete.len(),
        errored = errored.len(),
        server_changes = applied.len(),
        "merged sync results"
    );

    for change in &completed {
        shared.sink.path_state(&change.new_path, PathState::Synced);
    }
    ctx.summary.completed += completed.len();
    ctx.summary.server_changes = applied.len();
    ctx.summary.cursor = Some(cursor);
    ctx.failed.extend(errored);
    ctx.incomplete = incomplete;
    ctx.server_changes = applied;

    if shared.cancel.is_cancelled() {
        let incomplete = mem::take(&mut ctx.incomplete);
        ctx.carry_pending(incomplete);
        let server_changes = mem::take(&mut ctx.server_changes);
        ctx.carried.extend(server_changes);
        let dispatch = mem::take(&mut ctx.dispatch);
        ctx.carried.extend(dispatch);
        ctx.fail(SyncError::Cancelled);
        return RunPhase::RequeueFailures;
    }
    RunPhase::ReassignDependencies
}

/// Undoes server changes persisted before a failed merge; the cursor did
/// not move, so they come back with the next pull.
async fn discard_applied(shared: &Shared, applied: Vec<Change>) {
    for change in applied {
        if let Err(err) = shared
            .source
            .merge_to_persistent_store(MergeItem::Remove(change.event_id))
            .await
        {
            warn!(event_id = change.event_id, "failed to discard server change: {err}");
        }
    }
}

async fn reassign_dependencies(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    let mut candidates = Vec::new();
    for pending in mem::take(&mut ctx.incomplete) {
        let PendingChange { change, stream } = pending;
        if let Some(stream) = stream {
            ctx.streams.insert(change.event_id, stream);
        }
        candidates.push(change);
    }
    candidates.extend(mem::take(&mut ctx.server_changes));
    candidates.append(&mut ctx.dispatch);
    if candidates.is_empty() {
        return RunPhase::DispatchAsyncTransfers;
    }

    let mut reasons = HashMap::new();
    let mut failures = Vec::new();
    for (pending, err) in mem::take(&mut ctx.failed) {
        if pending.change.event_id > 0 {
            reasons.insert(pending.change.event_id, err);
            failures.push(pending.change);
        } else {
            ctx.failed.push((pending, err));
        }
    }

    let fallback = (candidates.clone(), failures.clone());
    let (output, errors) = match shared
        .source
        .reassign_dependencies(candidates, failures)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!("could not reassign dependencies, keeping current order: {err}");
            fallback
        }
    };

    for change in errors {
        let err = reasons.remove(&change.event_id).unwrap_or_else(|| {
            SyncError::change(&change.new_path, "blocked by a failed change")
        });
        ctx.failed.push((PendingChange::new(change), err));
    }
    ctx.dispatch = output;
    RunPhase::DispatchAsyncTransfers
}

async fn dispatch_transfers(shared: &Arc<Shared>, ctx: &mut RunContext) -> RunPhase {
    if shared.cancel.is_cancelled() {
        let dispatch = mem::take(&mut ctx.dispatch);
        ctx.carried.extend(dispatch);
        let transfers = mem::take(&mut ctx.transfers);
        ctx.carry_pending(transfers);
        ctx.fail(SyncError::Cancelled);
        return RunPhase::RequeueFailures;
    }

    let dispatch = mem::take(&mut ctx.dispatch);
    if let Err(err) = work_through(shared, ctx, dispatch.into(), true).await {
        ctx.fail(err);
    }
    // Anything that still needs the server waits for the next run.
    let leftover = mem::take(&mut ctx.to_communicate);
    ctx.carried.extend(leftover);

    for mut pending in mem::take(&mut ctx.transfers) {
        if pending.stream.is_none() {
            pending.stream = ctx.streams.remove(&pending.change.event_id);
        }
        if shared.cancel.is_cancelled() {
            ctx.carried.push(pending.change);
            continue;
        }
        debug!(event_id = pending.change.event_id, path = %pending.change.new_path, "dispatching transfer");
        shared.dispatch_transfer(pending);
        ctx.summary.dispatched += 1;
    }
    RunPhase::RequeueFailures
}

async fn requeue_failures(shared: &Shared, ctx: &mut RunContext) -> RunPhase {
    let unfinished = ctx.take_unfinished();
    ctx.carried.extend(unfinished);
    for (pending, err) in mem::take(&mut ctx.failed) {
        let PendingChange { change, stream } = pending;
        drop(stream);
        warn!(event_id = change.event_id, path = %change.new_path, "change failed: {err}");
        ctx.summary.failed += 1;
        let path = change.new_path.clone();
        if shared.requeue_failure(change, false).await.is_serious() {
            shared.sink.message(
                MessageLevel::Important,
                &format!("Giving up on {path} for now: {err}"),
            );
        }
    }
    for change in mem::take(&mut ctx.carried) {
        shared.requeue_failure(change, true).await;
    }
    ctx.streams.clear();
    RunPhase::Unlocked
}
