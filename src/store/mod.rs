#![forbid(unsafe_code)]

//! The record store: admission, lookups, recovery and status.
//!
//! Admission runs under a store-wide lock so goffs are handed out densely and
//! in order. Weight propagation happens on a background worker; readers may
//! observe a record before its weight has been applied.

pub mod meta;
/// Counters for admission and weight propagation.
pub mod metrics;
/// Store configuration.
pub mod options;
/// Status reports and health checks.
pub mod status;
pub mod tracker;
mod worker;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha384};
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::ShardLocks;
use crate::primitives::graphfile::GraphFile;
use crate::record::Record;
use crate::types::{DagError, Goff, GoffRange, Hash, RecordId, Result, Weight};

pub use meta::{MetaStore, PeerAddress, PutOutcome, RecordMeta};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StoreMetrics};
pub use options::{StoreOptions, Synchronous};
pub use status::{Check, HealthCheck, HealthStatus, StateHash, StatusReport};
pub use tracker::Hole;

use worker::{PropagationWorker, WorkQueue};

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn unix_secs() -> u64 {
    unix_millis() / 1_000
}

struct Admission {
    next_goff: u64,
    halted: bool,
}

/// State shared between the store handle and the weight worker.
pub(crate) struct Shared {
    pub(crate) options: StoreOptions,
    pub(crate) meta: MetaStore,
    pub(crate) graph: GraphFile,
    pub(crate) queue: WorkQueue,
    pub(crate) metrics: Arc<dyn StoreMetrics>,
    admission: Mutex<Admission>,
}

/// A record revision together with its current weight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoredRecord {
    /// Stored metadata.
    pub record: RecordMeta,
    /// Cumulative weight.
    pub weight: Weight,
}

/// Record store with background weight consensus.
pub struct Store {
    shared: Arc<Shared>,
    worker: Mutex<Option<PropagationWorker>>,
    closed: AtomicBool,
}

impl Store {
    /// Opens or creates a store, recovering from an unclean shutdown if needed.
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.path)?;
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let meta = MetaStore::open(options.meta_path(), options.synchronous)?;
        let clean = meta.was_clean_shutdown()?;
        meta.set_clean_shutdown(false)?;
        let graph = GraphFile::open(
            options.weights_path(),
            options.growth_chunk_slots,
            options.max_slots,
            ShardLocks::new(options.shard_count),
        )?;
        let max_goff = meta.get_max_goff()?;
        if let Some(max) = max_goff {
            graph.grow_to(max)?;
        }
        let start_worker = options.start_worker;
        let store = Self {
            shared: Arc::new(Shared {
                options,
                meta,
                graph,
                queue: WorkQueue::new(),
                metrics,
                admission: Mutex::new(Admission {
                    next_goff: 0,
                    halted: false,
                }),
            }),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        store.recover(clean, max_goff)?;
        if start_worker {
            store.start_worker()?;
        }
        info!(
            path = %store.shared.options.path.display(),
            clean,
            max_goff = max_goff.map(|g| g.0),
            queued = store.shared.queue.len(),
            "store.open"
        );
        Ok(store)
    }

    fn recover(&self, clean: bool, max_goff: Option<Goff>) -> Result<()> {
        let shared = &self.shared;
        let mut mismatched = 0u64;
        shared.meta.for_each_record(|goff, hash| {
            if !shared.graph.slot(goff).is_some_and(|slot| slot.belongs_to(&hash)) {
                mismatched += 1;
            }
            Ok(())
        })?;
        if !clean || mismatched > 0 {
            self.rebuild_weights(max_goff, mismatched)?;
        }
        self.reconcile_gaps()?;

        let hole_end = shared
            .meta
            .with_tracker(|tracker| tracker.holes())?
            .iter()
            .map(|hole| hole.range.end.0 + 1)
            .max()
            .unwrap_or(0);
        let next_goff = max_goff.map_or(0, |g| g.0 + 1).max(hole_end);
        shared.admission.lock().next_goff = next_goff;

        let pending = shared
            .meta
            .get_records_for_weight_application(i64::MAX as usize)?;
        debug!(pending = pending.len(), next_goff, "store.recover");
        shared.queue.push_all(pending);
        Ok(())
    }

    fn rebuild_weights(&self, max_goff: Option<Goff>, mismatched: u64) -> Result<()> {
        let shared = &self.shared;
        warn!(mismatched, "store.rebuild_weights");
        if let Some(max) = max_goff {
            shared.graph.reset_weights(max)?;
        }
        shared.meta.for_each_record(|goff, hash| {
            if shared.graph.slot(goff).is_some_and(|slot| slot.belongs_to(&hash)) {
                Ok(())
            } else {
                shared.graph.assign(goff, &hash)
            }
        })?;
        let flagged = shared.meta.flag_all_pending()?;
        let cleared = shared
            .meta
            .with_tracker(|tracker| tracker.clear_waiting_holes())?;
        shared.graph.flush()?;
        info!(flagged, cleared, "store.rebuild_weights.done");
        Ok(())
    }

    fn reconcile_gaps(&self) -> Result<()> {
        let meta = &self.shared.meta;
        let known = meta.with_tracker(|tracker| tracker.holes())?;
        for hole in known.iter().filter(|hole| hole.waiter.is_none()) {
            for goff in meta.goffs_in(hole.range)? {
                meta.resolve_hole(GoffRange::point(goff))?;
            }
        }
        let known = meta.with_tracker(|tracker| tracker.holes())?;
        for range in meta.missing_goff_ranges()? {
            let covered = known
                .iter()
                .any(|hole| hole.waiter.is_none() && hole.range.overlaps(&range));
            if !covered {
                warn!(start = range.start.0, end = range.end.0, "store.gap");
                meta.record_hole(&Hole::gap(range))?;
            }
        }
        Ok(())
    }

    /// Starts the weight worker if it is not already running.
    pub fn start_worker(&self) -> Result<()> {
        self.ensure_open()?;
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(PropagationWorker::spawn(Arc::clone(&self.shared))?);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DagError::Shutdown);
        }
        Ok(())
    }

    /// Validates and stores a record, then queues it for weight application.
    ///
    /// Re-submitting a stored record is not an error; it yields
    /// [`PutOutcome::Duplicate`].
    pub fn put(&self, record: &Record) -> Result<PutOutcome> {
        self.ensure_open()?;
        let shared = &self.shared;
        if let Err(err) = record.validate(&shared.options.limits, unix_secs()) {
            shared.metrics.record_rejected();
            debug!(hash = %record.hash(), error = %err, "store.put.rejected");
            return Err(err);
        }
        let hash = record.hash();
        let outcome = {
            let mut admission = shared.admission.lock();
            let goff = Goff(admission.next_goff);
            if admission.halted {
                return Err(DagError::Growth {
                    goff: goff.0,
                    source: io::Error::new(
                        io::ErrorKind::Other,
                        "admission halted after weight file growth failed; reopen the store",
                    ),
                });
            }
            if let Some(goff) = shared.meta.goff_by_hash(&hash)? {
                shared.metrics.record_duplicate();
                return Ok(PutOutcome::Duplicate { goff });
            }
            let capacity = shared.graph.capacity();
            if let Err(err) = shared.graph.grow_to(goff) {
                admission.halted = true;
                error!(goff = goff.0, error = %err, "store.put.growth_failed");
                return Err(err);
            }
            if shared.graph.capacity() > capacity {
                shared.metrics.graph_grown(shared.graph.capacity());
            }
            shared.graph.assign(goff, &hash)?;
            match shared.meta.put(record, goff) {
                Ok(outcome) => {
                    if !outcome.is_duplicate() {
                        admission.next_goff += 1;
                    }
                    outcome
                }
                Err(err) => {
                    self.abandon_goff(&mut admission, goff, &hash);
                    return Err(err);
                }
            }
        };
        match &outcome {
            PutOutcome::Stored { goff, released } => {
                shared.metrics.record_admitted();
                debug!(
                    goff = goff.0,
                    hash = %hash,
                    released = released.len(),
                    "store.put"
                );
                shared.queue.push(*goff);
                shared.queue.push_all(released.iter().copied());
            }
            PutOutcome::Duplicate { .. } => shared.metrics.record_duplicate(),
        }
        Ok(outcome)
    }

    /// After a failed metadata insert: reuse the goff if the insert rolled
    /// back, queue it if the insert landed anyway, otherwise skip past it and
    /// remember it as a hole.
    fn abandon_goff(&self, admission: &mut Admission, goff: Goff, hash: &Hash) {
        let meta = &self.shared.meta;
        match meta.goff_exists(goff) {
            Ok(false) => {}
            Ok(true) => {
                admission.next_goff += 1;
                self.shared.queue.push(goff);
                // The landed insert already deleted the dangling rows of any
                // referrers, so they are only reachable through the links.
                match meta.referrers(hash) {
                    Ok(referrers) => self.shared.queue.push_all(referrers),
                    Err(err) => {
                        error!(goff = goff.0, error = %err, "store.put.referrers_failed")
                    }
                }
            }
            Err(err) => {
                admission.next_goff += 1;
                warn!(goff = goff.0, error = %err, "store.put.goff_unknown");
                if let Err(err) = meta.record_hole(&Hole::gap(GoffRange::point(goff))) {
                    error!(goff = goff.0, error = %err, "store.put.hole_failed");
                }
            }
        }
    }

    /// Metadata of the record with `hash`.
    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<RecordMeta>> {
        self.shared.meta.get_by_hash(hash)
    }

    /// The full record with `hash`, value included.
    pub fn get_record(&self, hash: &Hash) -> Result<Option<Record>> {
        self.shared.meta.get_record(hash)
    }

    /// Every revision of `id`, by timestamp then hash.
    pub fn get_history_by_id(&self, id: &RecordId) -> Result<Vec<RecordMeta>> {
        self.shared.meta.get_history_by_id(id)
    }

    /// Highest assigned goff.
    pub fn get_max_goff(&self) -> Result<Option<Goff>> {
        self.shared.meta.get_max_goff()
    }

    /// Current weight at `goff`; zero when unassigned.
    pub fn get_score(&self, goff: Goff) -> Weight {
        self.shared.graph.read_weight(goff)
    }

    /// Current weight of the record with `hash`.
    pub fn weight_of(&self, hash: &Hash) -> Result<Option<Weight>> {
        Ok(self
            .shared
            .meta
            .goff_by_hash(hash)?
            .map(|goff| self.get_score(goff)))
    }

    /// Whether the record at `goff` has had its weight applied.
    pub fn is_applied(&self, goff: Goff) -> bool {
        self.shared
            .graph
            .slot(goff)
            .is_some_and(|slot| slot.is_assigned() && !slot.pending)
    }

    /// The winning revision of `id`: highest weight among applied revisions,
    /// smaller hash on ties.
    pub fn authoritative(&self, id: &RecordId) -> Result<Option<ScoredRecord>> {
        let mut best: Option<ScoredRecord> = None;
        for record in self.get_history_by_id(id)? {
            if !self.is_applied(record.goff) {
                continue;
            }
            let weight = self.get_score(record.goff);
            let better = match &best {
                None => true,
                Some(current) => {
                    weight > current.weight
                        || (weight == current.weight && record.hash < current.record.hash)
                }
            };
            if better {
                best = Some(ScoredRecord { record, weight });
            }
        }
        Ok(best)
    }

    /// Hashes linked to but not stored yet.
    pub fn list_wanted(&self) -> Result<BTreeSet<Hash>> {
        self.shared.meta.with_tracker(|tracker| tracker.list_wanted())
    }

    /// Notes that `hash` has been requested from peers.
    pub fn mark_wanted_requested(&self, hash: &Hash) -> Result<bool> {
        self.shared
            .meta
            .with_tracker(|tracker| tracker.mark_wanted_requested(hash, unix_millis()))
    }

    /// Records awaiting weight application.
    pub fn pending_count(&self) -> Result<u64> {
        self.shared.meta.with_tracker(|tracker| tracker.pending_count())
    }

    /// Outstanding holes.
    pub fn pending_hole_count(&self) -> Result<u64> {
        self.shared
            .meta
            .with_tracker(|tracker| tracker.pending_hole_count())
    }

    /// Every outstanding hole.
    pub fn holes(&self) -> Result<Vec<Hole>> {
        self.shared.meta.with_tracker(|tracker| tracker.holes())
    }

    /// Metadata store, for peer bookkeeping and diagnostics.
    pub fn meta(&self) -> &MetaStore {
        &self.shared.meta
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.shared.options
    }

    /// Blocks until the weight queue drains or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_idle(timeout)
    }

    /// Counts, sizes and health.
    pub fn status(&self) -> Result<StatusReport> {
        let shared = &self.shared;
        let (record_count, total_size) = shared.meta.record_count_and_size()?;
        let (pending_count, pending_hole_count, wanted_count) =
            shared.meta.with_tracker(|tracker| {
                Ok((
                    tracker.pending_count()?,
                    tracker.pending_hole_count()?,
                    tracker.wanted_count()?,
                ))
            })?;
        let graph_capacity = shared.graph.capacity();
        let halted = shared.admission.lock().halted;
        let running = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(PropagationWorker::is_running);

        let mut health = HealthCheck::new();
        health.add_check(Check::PendingBacklog {
            count: pending_count,
            threshold: shared.options.pending_warn_threshold,
            healthy: pending_count <= shared.options.pending_warn_threshold,
        });
        health.add_check(Check::HoleBacklog {
            count: pending_hole_count,
            threshold: shared.options.hole_warn_threshold,
            healthy: pending_hole_count <= shared.options.hole_warn_threshold,
        });
        health.add_check(Check::Growth {
            halted,
            capacity: graph_capacity,
            healthy: !halted,
        });
        health.add_check(Check::Worker {
            running,
            healthy: running || !shared.options.start_worker,
        });

        Ok(StatusReport {
            max_goff: shared.meta.get_max_goff()?.map(|g| g.0),
            record_count,
            total_size,
            pending_count,
            pending_hole_count,
            wanted_count,
            graph_capacity,
            health,
        })
    }

    /// Digest of every record hash and weight in goff order.
    pub fn hash_state(&self) -> Result<StateHash> {
        let mut hasher = Sha384::new();
        let mut weight_sum: Weight = 0;
        let mut record_count = 0u64;
        self.shared.meta.for_each_record(|goff, hash| {
            let weight = self.shared.graph.read_weight(goff);
            hasher.update(hash.as_bytes());
            hasher.update(weight.to_be_bytes());
            weight_sum = weight_sum.saturating_add(weight);
            record_count += 1;
            Ok(())
        })?;
        let mut digest = [0u8; 48];
        digest.copy_from_slice(&hasher.finalize());
        Ok(StateHash {
            digest,
            weight_sum,
            record_count,
        })
    }

    /// Stops the worker after its current batch, flushes, and marks the
    /// shutdown clean.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
        self.shared.graph.flush()?;
        self.shared.meta.set_clean_shutdown(true)?;
        info!(path = %self.shared.options.path.display(), "store.close");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "store.close_failed");
        }
    }
}
