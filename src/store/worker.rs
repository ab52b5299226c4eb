#![forbid(unsafe_code)]

//! Background weight propagation.
//!
//! A single thread drains a deduplicating queue of goffs. A record is applied
//! once all of its links are stored and applied: its contribution is added to
//! its own slot once and to every transitive ancestor once per link path, after
//! which its slot's pending flag is cleared. A record's weight therefore always
//! equals its own contribution plus the weights of its applied direct
//! referrers. Metadata pending flags are cleared per batch, after the weight
//! file has been flushed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::record::work_contribution;
use crate::store::tracker::Hole;
use crate::store::{unix_millis, Shared};
use crate::types::{DagError, Goff, GoffRange, Result, Weight};

const SWEEP_LIMIT: usize = 1024;
const WORKER_THREAD_NAME: &str = "dagstore-weights";

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Goff>,
    queued: FxHashSet<Goff>,
    busy: bool,
    shutdown: bool,
}

/// Deduplicating FIFO of goffs awaiting evaluation.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, goff: Goff) {
        self.push_all([goff]);
    }

    pub(crate) fn push_all(&self, goffs: impl IntoIterator<Item = Goff>) {
        let mut state = self.state.lock();
        let mut added = 0usize;
        for goff in goffs {
            if state.queued.insert(goff) {
                state.pending.push_back(goff);
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, queued = state.pending.len(), "worker.queue.enqueue");
            self.ready.notify_one();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Waits up to `wait` for work and takes up to `max` goffs. An empty batch
    /// means the wait timed out; `None` means shutdown.
    fn next_batch(&self, max: usize, wait: Duration) -> Option<Vec<Goff>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && !state.shutdown {
            let _ = self.ready.wait_for(&mut state, wait);
        }
        if state.shutdown {
            return None;
        }
        let take = max.min(state.pending.len());
        let batch: Vec<Goff> = state.pending.drain(..take).collect();
        for goff in &batch {
            state.queued.remove(goff);
        }
        state.busy = true;
        Some(batch)
    }

    fn finish_batch(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        if state.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Blocks until the queue is empty and no batch is in flight.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.pending.is_empty() || state.busy {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.pending.is_empty() && !state.busy;
            }
        }
        true
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.busy = false;
        self.ready.notify_all();
        self.idle.notify_all();
    }
}

/// Handle to the weight propagation thread.
pub(crate) struct PropagationWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PropagationWorker {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run(&thread_shared))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Lets the in-flight batch finish, then joins the thread.
    pub(crate) fn stop(&mut self) {
        self.shared.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker.panicked");
            }
        }
    }
}

impl Drop for PropagationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct WorkerState {
    retries: FxHashMap<Goff, u32>,
    unfinished: Vec<Goff>,
}

impl WorkerState {
    fn bump(&mut self, goff: Goff) -> u32 {
        let retries = self.retries.entry(goff).or_insert(0);
        *retries = retries.saturating_add(1);
        *retries
    }
}

enum Step {
    Applied,
    AlreadyApplied,
    Waiting,
    Skip,
}

fn run(shared: &Shared) {
    info!("worker.start");
    let interval = shared.options.sweep_interval();
    let batch_size = shared.options.worker_batch_size.max(1);
    let mut state = WorkerState::default();
    let mut last_sweep = Instant::now();
    while let Some(batch) = shared.queue.next_batch(batch_size, interval) {
        if !batch.is_empty() {
            process_batch(shared, &mut state, &batch);
        }
        if last_sweep.elapsed() >= interval {
            sweep(shared, &mut state);
            last_sweep = Instant::now();
        }
        shared.queue.finish_batch();
    }
    info!("worker.stop");
}

fn process_batch(shared: &Shared, state: &mut WorkerState, batch: &[Goff]) {
    debug!(size = batch.len(), "worker.batch.start");
    let mut completed = Vec::new();
    let mut waiting = 0usize;
    for &goff in batch {
        match evaluate(shared, state, goff) {
            Ok(Step::Applied) | Ok(Step::AlreadyApplied) => completed.push(goff),
            Ok(Step::Waiting) => waiting += 1,
            Ok(Step::Skip) => {}
            Err(err) => park(shared, state, goff, &err),
        }
    }
    if !completed.is_empty() {
        if let Err(err) = finalize(shared, state, &completed) {
            error!(error = %err, completed = completed.len(), "worker.batch.finalize_failed");
            state.unfinished.extend_from_slice(&completed);
        }
    }
    debug!(
        completed = completed.len(),
        waiting, "worker.batch.done"
    );
}

fn evaluate(shared: &Shared, state: &mut WorkerState, goff: Goff) -> Result<Step> {
    let Some(job) = shared.meta.weight_job(goff)? else {
        warn!(goff = goff.0, "worker.unknown_goff");
        return Ok(Step::Skip);
    };
    if !job.pending {
        return Ok(Step::Skip);
    }
    let slot = shared
        .graph
        .slot(goff)
        .ok_or_else(|| DagError::Inconsistency(format!("goff {goff} has no weight slot")))?;
    if !slot.belongs_to(&job.hash) {
        return Err(DagError::Inconsistency(format!(
            "weight slot {goff} does not belong to {}",
            job.hash
        )));
    }
    if !slot.pending {
        return Ok(Step::AlreadyApplied);
    }

    let mut blocked = false;
    for link in &job.links {
        // Dangling: the link's arrival re-enqueues this record.
        let Some(target) = link.goff else {
            blocked = true;
            continue;
        };
        match shared.graph.slot(target) {
            Some(linked) if linked.belongs_to(&link.hash) => {
                if linked.pending {
                    shared.meta.record_hole(&Hole::waiting(target, goff))?;
                    blocked = true;
                }
            }
            _ => {
                shared.metrics.inconsistency();
                let retries = state.bump(goff);
                let delay = shared.options.retry_delay(retries - 1);
                warn!(
                    goff = goff.0,
                    link = %link.hash,
                    target = target.0,
                    retries,
                    "worker.link_inconsistent"
                );
                shared.meta.record_hole(&Hole::retry(
                    target,
                    goff,
                    retries,
                    unix_millis().saturating_add(delay.as_millis() as u64),
                ))?;
                blocked = true;
            }
        }
    }
    if blocked {
        return Ok(Step::Waiting);
    }

    let paths = path_counts(goff, &shared.meta.ancestor_edges(goff)?)?;
    for target in paths.keys() {
        let assigned = shared.graph.slot(*target).is_some_and(|s| s.is_assigned());
        if !assigned {
            return Err(DagError::Inconsistency(format!(
                "ancestor {target} of {goff} has no weight slot"
            )));
        }
    }
    let contribution = work_contribution(job.work);
    let mut deltas: Vec<(Goff, Weight)> = paths
        .into_iter()
        .map(|(target, count)| (target, contribution.saturating_mul(count)))
        .collect();
    deltas.sort_unstable_by_key(|(target, _)| *target);
    shared.graph.add_weights(&deltas)?;
    shared.graph.set_pending(goff, false)?;
    shared.metrics.weight_applied(deltas.len());
    debug!(goff = goff.0, touched = deltas.len(), "worker.apply");
    Ok(Step::Applied)
}

/// Number of distinct link paths from `root` to each record reachable over
/// `edges`, with `root` itself counted once.
///
/// Counts are pushed along edges in topological order; a node left unvisited
/// means the links form a cycle.
fn path_counts(root: Goff, edges: &[(Goff, Goff)]) -> Result<FxHashMap<Goff, Weight>> {
    let mut children: FxHashMap<Goff, Vec<Goff>> = FxHashMap::default();
    let mut indegree: FxHashMap<Goff, usize> = FxHashMap::default();
    indegree.insert(root, 0);
    for &(from, to) in edges {
        children.entry(from).or_default().push(to);
        indegree.entry(from).or_insert(0);
        *indegree.entry(to).or_insert(0) += 1;
    }
    let mut paths: FxHashMap<Goff, Weight> = FxHashMap::default();
    paths.insert(root, 1);
    let mut ready = VecDeque::from([root]);
    let mut visited = 0usize;
    while let Some(node) = ready.pop_front() {
        visited += 1;
        let count = paths.get(&node).copied().unwrap_or(0);
        for &child in children.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            let total = paths.entry(child).or_insert(0);
            *total = total.saturating_add(count);
            if let Some(remaining) = indegree.get_mut(&child).filter(|left| **left > 0) {
                *remaining -= 1;
                if *remaining == 0 {
                    ready.push_back(child);
                }
            }
        }
    }
    if visited != indegree.len() {
        return Err(DagError::Inconsistency(format!(
            "links reachable from {root} form a cycle"
        )));
    }
    Ok(paths)
}

fn finalize(shared: &Shared, state: &mut WorkerState, completed: &[Goff]) -> Result<()> {
    shared.graph.flush()?;
    shared.meta.delete_completed_pending(completed)?;
    let mut released = Vec::new();
    for goff in completed {
        state.retries.remove(goff);
        released.extend(shared.meta.resolve_hole(GoffRange::point(*goff))?);
    }
    if !released.is_empty() {
        debug!(released = released.len(), "worker.holes_released");
        shared.queue.push_all(released);
    }
    Ok(())
}

fn park(shared: &Shared, state: &mut WorkerState, goff: Goff, err: &DagError) {
    if matches!(err, DagError::Inconsistency(_)) {
        shared.metrics.inconsistency();
    }
    shared.metrics.record_parked();
    let retries = state.bump(goff);
    let delay = shared.options.retry_delay(retries - 1);
    warn!(
        goff = goff.0,
        retries,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "worker.park"
    );
    let hole = Hole::retry(
        goff,
        goff,
        retries,
        unix_millis().saturating_add(delay.as_millis() as u64),
    );
    if let Err(record_err) = shared.meta.record_hole(&hole) {
        error!(goff = goff.0, error = %record_err, "worker.park_failed");
        state.unfinished.push(goff);
    }
}

fn sweep(shared: &Shared, state: &mut WorkerState) {
    let now = unix_millis();
    let due = shared.meta.with_tracker(|tracker| {
        let due = tracker.due_holes(now, SWEEP_LIMIT)?;
        for hole in &due {
            tracker.take_hole(hole)?;
        }
        Ok(due)
    });
    match due {
        Ok(due) => {
            if !due.is_empty() {
                debug!(due = due.len(), "worker.sweep");
            }
            shared
                .queue
                .push_all(due.iter().filter_map(|hole| hole.waiter));
        }
        Err(err) => error!(error = %err, "worker.sweep_failed"),
    }
    if !state.unfinished.is_empty() {
        shared.queue.push_all(state.unfinished.drain(..));
    }
}
