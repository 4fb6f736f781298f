//! In-process admission counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the rate limiter, the circuit breaker and the pipeline.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    rate_limit_allowed: AtomicU64,
    rate_limit_denied: AtomicU64,
    circuit_rejected: AtomicU64,
    stale_reports: AtomicU64,
    store_failures: AtomicU64,
    degraded_decisions: AtomicU64,
    state_transitions: AtomicU64,
}

/// Point-in-time copy of [`AdmissionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub rate_limit_allowed: u64,
    pub rate_limit_denied: u64,
    pub circuit_rejected: u64,
    pub stale_reports: u64,
    pub store_failures: u64,
    pub degraded_decisions: u64,
    pub state_transitions: u64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_rate_limit(&self, allowed: bool) {
        let counter = if allowed {
            &self.rate_limit_allowed
        } else {
            &self.rate_limit_denied
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejected(&self) {
        self.circuit_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_report(&self) {
        self.stale_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An admission decision was made without the store.
    pub(crate) fn record_degraded(&self) {
        self.degraded_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rate_limit_allowed: self.rate_limit_allowed.load(Ordering::Relaxed),
            rate_limit_denied: self.rate_limit_denied.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            stale_reports: self.stale_reports.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            degraded_decisions: self.degraded_decisions.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = AdmissionMetrics::new();
        metrics.record_rate_limit(true);
        metrics.record_rate_limit(true);
        metrics.record_rate_limit(false);
        metrics.record_store_failure();
        metrics.record_store_failure();
        metrics.record_degraded();
        metrics.record_stale_report();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_limit_allowed, 2);
        assert_eq!(snapshot.rate_limit_denied, 1);
        assert_eq!(snapshot.store_failures, 2);
        assert_eq!(snapshot.degraded_decisions, 1);
        assert_eq!(snapshot.stale_reports, 1);
        assert_eq!(snapshot.circuit_rejected, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsSnapshot::default()).unwrap();
        assert_eq!(json["stale_reports"], 0);
    }
}
