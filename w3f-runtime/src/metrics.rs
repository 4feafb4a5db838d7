//! Lightweight runtime counters.
//!
//! A single process-wide instance, returned by [`metrics()`], aggregates every
//! run, pooled or not.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters, relaxed ordering. Values are approximate gauges read
/// periodically, so strict ordering isn't needed.
pub struct RuntimeMetrics {
    pub total_runs: AtomicU64,
    pub successful_runs: AtomicU64,
    pub failed_runs: AtomicU64,
    /// Runs where at least one ceiling was exceeded.
    pub throttled_runs: AtomicU64,
    /// Cumulative execution time across all runs (milliseconds).
    pub total_duration_ms: AtomicU64,
    pub active_runners: AtomicU64,
    pub peak_runners: AtomicU64,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub const fn new() -> Self {
        Self {
            total_runs: AtomicU64::new(0),
            successful_runs: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
            throttled_runs: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_runners: AtomicU64::new(0),
            peak_runners: AtomicU64::new(0),
        }
    }

    /// Record a finished invocation.
    pub fn record_run(&self, success: bool, throttled: bool, duration_ms: u64) {
        self.total_runs.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        if success {
            self.successful_runs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_runs.fetch_add(1, Ordering::Relaxed);
        }
        if throttled {
            self.throttled_runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn runner_started(&self) {
        let current = self.active_runners.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_runners.fetch_max(current, Ordering::Relaxed);
    }

    /// Count a runner as active until the returned guard drops, unwinding
    /// included.
    pub fn track_runner(&self) -> ActiveRunner<'_> {
        self.runner_started();
        ActiveRunner { metrics: self }
    }

    pub fn runner_finished(&self) {
        let _ = self
            .active_runners
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Snapshot all metrics as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let total_runs = self.total_runs.load(Ordering::Relaxed);
        let avg_duration_ms = if total_runs > 0 {
            self.total_duration_ms.load(Ordering::Relaxed) / total_runs
        } else {
            0
        };

        vec![
            ("total_runs".into(), total_runs),
            ("avg_duration_ms".into(), avg_duration_ms),
            (
                "successful_runs".into(),
                self.successful_runs.load(Ordering::Relaxed),
            ),
            (
                "failed_runs".into(),
                self.failed_runs.load(Ordering::Relaxed),
            ),
            (
                "throttled_runs".into(),
                self.throttled_runs.load(Ordering::Relaxed),
            ),
            (
                "active_runners".into(),
                self.active_runners.load(Ordering::Relaxed),
            ),
            (
                "peak_runners".into(),
                self.peak_runners.load(Ordering::Relaxed),
            ),
        ]
    }
}

pub struct ActiveRunner<'a> {
    metrics: &'a RuntimeMetrics,
}

impl Drop for ActiveRunner<'_> {
    fn drop(&mut self) {
        self.metrics.runner_finished();
    }
}

/// Global metrics instance.
static METRICS: RuntimeMetrics = RuntimeMetrics::new();

/// Returns the global metrics tracker.
pub fn metrics() -> &'static RuntimeMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(snapshot: &[(String, u64)], key: &str) -> u64 {
        snapshot
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .unwrap()
    }

    #[test]
    fn peak_tracks_max_concurrency() {
        let m = RuntimeMetrics::new();
        m.runner_started();
        m.runner_started();
        m.runner_finished();
        m.runner_started();
        m.runner_finished();
        m.runner_finished();
        m.runner_finished();

        let snap = m.snapshot();
        assert_eq!(value(&snap, "active_runners"), 0);
        assert_eq!(value(&snap, "peak_runners"), 2);
    }

    #[test]
    fn active_runner_released_on_panic() {
        let m = RuntimeMetrics::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _active = m.track_runner();
            panic!("factory exploded");
        }));
        assert!(outcome.is_err());

        let snap = m.snapshot();
        assert_eq!(value(&snap, "active_runners"), 0);
        assert_eq!(value(&snap, "peak_runners"), 1);
    }

    #[test]
    fn record_run_splits_outcomes() {
        let m = RuntimeMetrics::new();
        m.record_run(true, false, 100);
        m.record_run(false, true, 300);

        let snap = m.snapshot();
        assert_eq!(value(&snap, "total_runs"), 2);
        assert_eq!(value(&snap, "avg_duration_ms"), 200);
        assert_eq!(value(&snap, "successful_runs"), 1);
        assert_eq!(value(&snap, "failed_runs"), 1);
        assert_eq!(value(&snap, "throttled_runs"), 1);
    }
}
