use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for every best-effort path in the analytics pipeline.
///
/// Errors that are intentionally swallowed (dropped events, cache outages,
/// failed folds) are counted here so drop and error rates can be monitored
/// without changing control flow.
#[derive(Debug, Default)]
pub struct Diagnostics {
    events_captured: AtomicU64,
    events_dropped: AtomicU64,
    raw_log_errors: AtomicU64,
    counter_errors: AtomicU64,
    etl_runs: AtomicU64,
    etl_fold_errors: AtomicU64,
    stats_cache_errors: AtomicU64,
    stats_recomputes: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub events_captured: u64,
    pub events_dropped: u64,
    pub raw_log_errors: u64,
    pub counter_errors: u64,
    pub etl_runs: u64,
    pub etl_fold_errors: u64,
    pub stats_cache_errors: u64,
    pub stats_recomputes: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_captured(&self) {
        self.events_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn raw_log_error(&self) {
        self.raw_log_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_error(&self) {
        self.counter_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn etl_run(&self) {
        self.etl_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn etl_fold_error(&self) {
        self.etl_fold_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats_cache_error(&self) {
        self.stats_cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats_recompute(&self) {
        self.stats_recomputes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            raw_log_errors: self.raw_log_errors.load(Ordering::Relaxed),
            counter_errors: self.counter_errors.load(Ordering::Relaxed),
            etl_runs: self.etl_runs.load(Ordering::Relaxed),
            etl_fold_errors: self.etl_fold_errors.load(Ordering::Relaxed),
            stats_cache_errors: self.stats_cache_errors.load(Ordering::Relaxed),
            stats_recomputes: self.stats_recomputes.load(Ordering::Relaxed),
        }
    }
}
