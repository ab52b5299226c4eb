#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::concurrency::DEFAULT_SHARD_COUNT;
use crate::primitives::graphfile::DEFAULT_GROWTH_CHUNK_SLOTS;
use crate::record::RecordLimits;
use crate::store::metrics::StoreMetrics;
use crate::types::{DagError, Result};

/// Durability mode applied to the metadata database.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync on every commit.
    #[default]
    Full,
    /// Sync at WAL checkpoints only.
    Normal,
    /// Leave syncing to the OS.
    Off,
}

impl Synchronous {
    /// Pragma value.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a mode, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Configuration supplied when opening a [`super::Store`].
///
/// Loadable from TOML; the metrics sink can only be set in code.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Directory holding the metadata database and the weight file.
    pub path: PathBuf,
    /// Number of shard locks guarding weight slots.
    pub shard_count: usize,
    /// Slots added to the weight file per growth step.
    pub growth_chunk_slots: u64,
    /// Hard cap on weight file slots; growth beyond it halts ingestion.
    pub max_slots: Option<u64>,
    /// Records handled per weight worker batch.
    pub worker_batch_size: usize,
    /// Whether to start the weight worker on open.
    pub start_worker: bool,
    /// First retry delay for a parked record, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Ceiling for the retry delay, in milliseconds.
    pub retry_backoff_max_ms: u64,
    /// How often the worker looks for holes due for retry, in milliseconds.
    pub retry_sweep_interval_ms: u64,
    /// Admission limits.
    pub limits: RecordLimits,
    /// Metadata durability mode.
    pub synchronous: Synchronous,
    /// Pending records above which status reports degraded.
    pub pending_warn_threshold: u64,
    /// Outstanding holes above which status reports degraded.
    pub hole_warn_threshold: u64,
    /// Optional metrics sink.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn StoreMetrics>>,
}

impl StoreOptions {
    /// Default options rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the shard lock count.
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Sets the weight file growth step.
    pub fn growth_chunk_slots(mut self, slots: u64) -> Self {
        self.growth_chunk_slots = slots;
        self
    }

    /// Caps the weight file size in slots.
    pub fn max_slots(mut self, slots: Option<u64>) -> Self {
        self.max_slots = slots;
        self
    }

    /// Sets the worker batch size.
    pub fn worker_batch_size(mut self, size: usize) -> Self {
        self.worker_batch_size = size;
        self
    }

    /// Enables or disables the weight worker.
    pub fn start_worker(mut self, start: bool) -> Self {
        self.start_worker = start;
        self
    }

    /// Sets retry backoff base and ceiling.
    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base_ms = base.as_millis() as u64;
        self.retry_backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// Sets the retry sweep interval.
    pub fn retry_sweep_interval(mut self, interval: Duration) -> Self {
        self.retry_sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets admission limits.
    pub fn limits(mut self, limits: RecordLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the metadata durability mode.
    pub fn synchronous(mut self, mode: Synchronous) -> Self {
        self.synchronous = mode;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry delay for the `retries`-th attempt: base doubled per retry, capped.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let factor = 1u64.checked_shl(retries.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_interval_ms.max(1))
    }

    /// Path of the metadata database.
    pub fn meta_path(&self) -> PathBuf {
        self.path.join("meta.db")
    }

    /// Path of the weight file.
    pub fn weights_path(&self) -> PathBuf {
        self.path.join("weights.bin")
    }

    /// Rejects settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(DagError::Config("shard_count must be at least 1".into()));
        }
        if self.growth_chunk_slots == 0 {
            return Err(DagError::Config(
                "growth_chunk_slots must be at least 1".into(),
            ));
        }
        if self.worker_batch_size == 0 {
            return Err(DagError::Config(
                "worker_batch_size must be at least 1".into(),
            ));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(DagError::Config(format!(
                "retry_backoff_base_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.retry_backoff_base_ms, self.retry_backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(text).map_err(|err| DagError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| DagError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|err| DagError::Config(format!("{}: {err}", path.display())))
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dagstore"),
            shard_count: DEFAULT_SHARD_COUNT,
            growth_chunk_slots: DEFAULT_GROWTH_CHUNK_SLOTS,
            max_slots: None,
            worker_batch_size: 256,
            start_worker: true,
            retry_backoff_base_ms: 250,
            retry_backoff_max_ms: 60_000,
            retry_sweep_interval_ms: 1_000,
            limits: RecordLimits::default(),
            synchronous: Synchronous::Full,
            pending_warn_threshold: 100_000,
            hole_warn_threshold: 10_000,
            metrics: None,
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("path", &self.path)
            .field("shard_count", &self.shard_count)
            .field("growth_chunk_slots", &self.growth_chunk_slots)
            .field("max_slots", &self.max_slots)
            .field("worker_batch_size", &self.worker_batch_size)
            .field("start_worker", &self.start_worker)
            .field("synchronous", &self.synchronous)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}
