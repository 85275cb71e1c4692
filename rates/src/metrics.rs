//! Refresh metrics and health signals.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use ratekeeper_common::{now, Timestamp};
use serde::Serialize;

/// Counters for the refresh loop.
pub struct RefreshMetrics {
    /// Cycles started (including skipped ticks).
    pub cycles_total: AtomicU64,
    /// Cycles that stored every configured quote and wrote history.
    pub cycles_committed: AtomicU64,
    /// Cycles that stored only some quotes.
    pub cycles_partial: AtomicU64,
    /// Cycles whose fetch failed.
    pub cycles_failed: AtomicU64,
    /// Ticks dropped because a cycle was still running.
    pub cycles_skipped: AtomicU64,
    /// History entries appended.
    pub history_appended: AtomicU64,
    /// Store writes that failed.
    pub store_errors: AtomicU64,
    /// Failed cycles since the last committed one.
    pub consecutive_failures: AtomicU64,
    last_success_at: RwLock<Option<Timestamp>>,
    last_error: RwLock<Option<String>>,
}

impl RefreshMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_committed: AtomicU64::new(0),
            cycles_partial: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            history_appended: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Increment cycles started.
    pub fn cycle_started(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle that stored every quote.
    pub fn cycle_committed(&self) {
        self.cycles_committed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_success_at.write() = Some(now());
    }

    /// Record a cycle that stored only some quotes.
    pub fn cycle_partial(&self, reason: impl Into<String>) {
        self.cycles_partial.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(reason.into());
    }

    /// Record a failed cycle.
    pub fn cycle_failed(&self, reason: impl Into<String>) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(reason.into());
    }

    /// Record a skipped tick.
    pub fn cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment history entries appended.
    pub fn history_appended(&self) {
        self.history_appended.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment store errors.
    pub fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// When the last complete refresh finished.
    pub fn last_success_at(&self) -> Option<Timestamp> {
        *self.last_success_at.read()
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_committed: self.cycles_committed.load(Ordering::Relaxed),
            cycles_partial: self.cycles_partial.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            history_appended: self.history_appended.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_at: self.last_success_at(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let last_success = snapshot
            .last_success_at
            .map(|t| t.timestamp())
            .unwrap_or(0);
        format!(
            r#"# HELP ratekeeper_refresh_cycles_total Total refresh cycles started
# TYPE ratekeeper_refresh_cycles_total counter
ratekeeper_refresh_cycles_total {}

# HELP ratekeeper_refresh_cycles_committed Cycles that stored every quote
# TYPE ratekeeper_refresh_cycles_committed counter
ratekeeper_refresh_cycles_committed {}

# HELP ratekeeper_refresh_cycles_partial Cycles that stored only some quotes
# TYPE ratekeeper_refresh_cycles_partial counter
ratekeeper_refresh_cycles_partial {}

# HELP ratekeeper_refresh_cycles_failed Cycles whose fetch failed
# TYPE ratekeeper_refresh_cycles_failed counter
ratekeeper_refresh_cycles_failed {}

# HELP ratekeeper_refresh_cycles_skipped Ticks skipped while a cycle was running
# TYPE ratekeeper_refresh_cycles_skipped counter
ratekeeper_refresh_cycles_skipped {}

# HELP ratekeeper_history_appended Total history entries appended
# TYPE ratekeeper_history_appended counter
ratekeeper_history_appended {}

# HELP ratekeeper_store_errors Total failed store writes
# TYPE ratekeeper_store_errors counter
ratekeeper_store_errors {}

# HELP ratekeeper_consecutive_failures Failed cycles since the last complete one
# TYPE ratekeeper_consecutive_failures gauge
ratekeeper_consecutive_failures {}

# HELP ratekeeper_last_success_timestamp Unix time of the last complete refresh
# TYPE ratekeeper_last_success_timestamp gauge
ratekeeper_last_success_timestamp {}
"#,
            snapshot.cycles_total,
            snapshot.cycles_committed,
            snapshot.cycles_partial,
            snapshot.cycles_failed,
            snapshot.cycles_skipped,
            snapshot.history_appended,
            snapshot.store_errors,
            snapshot.consecutive_failures,
            last_success,
        )
    }
}

impl Default for RefreshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RefreshMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_total: u64,
    pub cycles_committed: u64,
    pub cycles_partial: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub history_appended: u64,
    pub store_errors: u64,
    pub consecutive_failures: u64,
    pub last_success_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streak_resets_on_commit() {
        let metrics = RefreshMetrics::new();
        metrics.cycle_failed("network");
        metrics.cycle_partial("missing EUR");
        assert_eq!(metrics.snapshot().consecutive_failures, 2);
        assert!(metrics.last_success_at().is_none());

        metrics.cycle_committed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_success_at.is_some());
        assert_eq!(snapshot.last_error.as_deref(), Some("missing EUR"));
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = RefreshMetrics::new();
        metrics.cycle_started();
        metrics.cycle_skipped();
        let text = metrics.to_prometheus();
        assert!(text.contains("ratekeeper_refresh_cycles_total 1"));
        assert!(text.contains("ratekeeper_refresh_cycles_skipped 1"));
        assert!(text.contains("ratekeeper_last_success_timestamp 0"));
    }
}
