#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for ingestion and weight propagation counters.
///
/// Admission hooks run on the caller's thread while it holds the admission
/// lock; propagation hooks run on the weight worker between slot updates.
/// Implementations must be cheap and thread-safe, and must not call back into
/// the store.
pub trait StoreMetrics: Send + Sync {
    /// Records a record stored under a fresh goff.
    fn record_admitted(&self);

    /// Records a submission whose hash was already stored.
    fn record_duplicate(&self);

    /// Records a submission rejected by validation before any goff was taken.
    fn record_rejected(&self);

    /// Records one completed weight application.
    ///
    /// # Parameters
    /// * `touched` - Number of slots updated: the record itself plus every
    ///   ancestor it reaches over links.
    fn weight_applied(&self, touched: usize);

    /// Records a record parked as a retry hole after a failed evaluation.
    fn record_parked(&self);

    /// Records a disagreement between metadata and the weight file, such as a
    /// link whose slot belongs to another record.
    fn inconsistency(&self);

    /// Records a weight file growth step.
    ///
    /// # Parameters
    /// * `capacity` - Slot capacity after growing.
    fn graph_grown(&self, capacity: u64);
}

/// A no-op implementation of [`StoreMetrics`].
///
/// Used when no sink is configured; every hook compiles down to nothing.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn record_admitted(&self) {}
    fn record_duplicate(&self) {}
    fn record_rejected(&self) {}
    fn weight_applied(&self, _touched: usize) {}
    fn record_parked(&self) {}
    fn inconsistency(&self) {}
    fn graph_grown(&self, _capacity: u64) {}
}

/// A thread-safe counter implementation of [`StoreMetrics`].
///
/// Counters are relaxed atomics and may be read from any thread at any time.
#[derive(Default)]
pub struct CounterMetrics {
    /// Records stored.
    pub admitted: AtomicU64,
    /// Duplicate submissions.
    pub duplicates: AtomicU64,
    /// Submissions that failed validation.
    pub rejected: AtomicU64,
    /// Records whose weight was applied.
    pub applied: AtomicU64,
    /// Slot updates performed by weight application.
    pub slots_touched: AtomicU64,
    /// Records parked for retry.
    pub parked: AtomicU64,
    /// Inconsistencies detected.
    pub inconsistencies: AtomicU64,
    /// Last observed weight file capacity.
    pub graph_capacity: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn weight_applied(&self, touched: usize) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.slots_touched
            .fetch_add(touched as u64, Ordering::Relaxed);
    }

    fn record_parked(&self) {
        self.parked.fetch_add(1, Ordering::Relaxed);
    }

    fn inconsistency(&self) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    fn graph_grown(&self, capacity: u64) {
        self.graph_capacity.store(capacity, Ordering::Relaxed);
    }
}

/// The metrics sink used when none is configured.
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
