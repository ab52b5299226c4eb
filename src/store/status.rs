#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Overall verdict of a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Everything within thresholds.
    Healthy,
    /// Backlogs above thresholds; still ingesting.
    Degraded,
    /// Ingestion halted.
    Unhealthy,
}

/// Individual checks folded into [`HealthCheck`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    /// Records still waiting for weight application.
    PendingBacklog {
        /// Pending records.
        count: u64,
        /// Degraded above this.
        threshold: u64,
        /// Within threshold.
        healthy: bool,
    },
    /// Outstanding holes.
    HoleBacklog {
        /// Holes recorded.
        count: u64,
        /// Degraded above this.
        threshold: u64,
        /// Within threshold.
        healthy: bool,
    },
    /// Weight file growth state.
    Growth {
        /// Last growth attempt failed; admissions are refused.
        halted: bool,
        /// Slots currently mapped.
        capacity: u64,
        /// Within limits.
        healthy: bool,
    },
    /// Weight worker liveness.
    Worker {
        /// Worker thread running.
        running: bool,
        /// Running or deliberately disabled.
        healthy: bool,
    },
}

impl Check {
    fn healthy(&self) -> bool {
        match self {
            Check::PendingBacklog { healthy, .. }
            | Check::HoleBacklog { healthy, .. }
            | Check::Growth { healthy, .. }
            | Check::Worker { healthy, .. } => *healthy,
        }
    }
}

/// Aggregated health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst status seen across checks.
    pub status: HealthStatus,
    /// Individual checks in evaluation order.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Starts healthy with no checks.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Folds in one check. A halted growth check is fatal; any other failure
    /// degrades.
    pub fn add_check(&mut self, check: Check) {
        if !check.healthy() {
            let fatal = matches!(check, Check::Growth { halted: true, .. });
            self.status = match (self.status, fatal) {
                (_, true) | (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
                _ => HealthStatus::Degraded,
            };
        }
        self.checks.push(check);
    }

    /// Whether every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot returned by [`super::Store::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Highest assigned goff.
    pub max_goff: Option<u64>,
    /// Records stored.
    pub record_count: u64,
    /// Approximate bytes of stored records.
    pub total_size: u64,
    /// Records awaiting weight application.
    pub pending_count: u64,
    /// Outstanding holes.
    pub pending_hole_count: u64,
    /// Hashes linked to but not yet stored.
    pub wanted_count: u64,
    /// Weight file capacity in slots.
    pub graph_capacity: u64,
    /// Health verdict.
    pub health: HealthCheck,
}

/// Deterministic digest of record set and weights, for comparing replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash {
    /// SHA-384 over `(hash, weight)` of every record in goff order.
    pub digest: [u8; 48],
    /// Saturating sum of all weights.
    pub weight_sum: u128,
    /// Records included.
    pub record_count: u64,
}

impl StateHash {
    /// Hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}
