//! Pipeline counters.
//!
//! Lightweight relaxed atomics shared between the coordinator and the result
//! router. Useful for smoke-checking a deployment and asserted on in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one pipeline instance.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Requests that entered the first stage's channel. A submit that times
    /// out while backpressured is not counted.
    pub submitted: AtomicU64,

    /// Requests resolved with a success value.
    pub resolved_ok: AtomicU64,

    /// Requests resolved with a stage error.
    pub resolved_err: AtomicU64,

    /// Results discarded because no slot was registered (timed-out or
    /// evicted requests).
    pub dropped_results: AtomicU64,
}

impl PipelineStats {
    /// Creates a new shared stats instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_resolved_ok(&self) {
        self.resolved_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_resolved_err(&self) {
        self.resolved_err.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped_result(&self) {
        self.dropped_results.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            resolved_ok: self.resolved_ok.load(Ordering::Relaxed),
            resolved_err: self.resolved_err.load(Ordering::Relaxed),
            dropped_results: self.dropped_results.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub resolved_ok: u64,
    pub resolved_err: u64,
    pub dropped_results: u64,
}

impl StatsSnapshot {
    /// Requests still somewhere between submission and resolution.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.resolved_ok + self.resolved_err + self.dropped_results)
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "submitted: {}, ok: {}, err: {}, dropped: {}",
            self.submitted, self.resolved_ok, self.resolved_err, self.dropped_results
        )
    }
}
