//! Process-lifetime counters for the telemetry pipeline itself

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vigil_core::OperationClass;

fn class_index(class: OperationClass) -> usize {
    match class {
        OperationClass::SecurityOperation => 0,
        OperationClass::Encryption => 1,
        OperationClass::AuditLog => 2,
        OperationClass::KeyRotation => 3,
    }
}

/// Monotonic counters, reset only when the process restarts
#[derive(Clone)]
pub struct TelemetryCounters {
    inner: Arc<CountersInner>,
}

#[derive(Default)]
struct CountersInner {
    recorded: [AtomicU64; 4],
    failures: [AtomicU64; 4],
    rows_purged: [AtomicU64; 4],
    records_written: AtomicU64,
    write_retries: AtomicU64,
    dropped_metrics: AtomicU64,
    recording_errors: AtomicU64,
}

impl TelemetryCounters {
    /// Create a new set of zeroed counters
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CountersInner::default()),
        }
    }

    /// Record that a scope emitted a record
    pub fn record_emitted(&self, class: OperationClass, success: bool) {
        let idx = class_index(class);
        self.inner.recorded[idx].fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.failures[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a record that reached the store
    pub fn record_written(&self) {
        self.inner.records_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried store append
    pub fn record_retry(&self) {
        self.inner.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record given up on
    pub fn record_dropped(&self) {
        self.inner.dropped_metrics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a measurement that could not be handed to the sink
    pub fn record_recording_error(&self) {
        self.inner.recording_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rows removed by retention
    pub fn record_purged(&self, class: OperationClass, rows: u64) {
        self.inner.rows_purged[class_index(class)].fetch_add(rows, Ordering::Relaxed);
    }

    /// Get current counters snapshot
    pub fn snapshot(&self) -> CountersSnapshot {
        let per_class = |counters: &[AtomicU64; 4]| {
            OperationClass::ALL.map(|class| {
                (class, counters[class_index(class)].load(Ordering::Relaxed))
            })
        };

        CountersSnapshot {
            recorded: per_class(&self.inner.recorded),
            failures: per_class(&self.inner.failures),
            rows_purged: per_class(&self.inner.rows_purged),
            records_written: self.inner.records_written.load(Ordering::Relaxed),
            write_retries: self.inner.write_retries.load(Ordering::Relaxed),
            dropped_metrics: self.inner.dropped_metrics.load(Ordering::Relaxed),
            recording_errors: self.inner.recording_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current counters
#[derive(Debug, Clone)]
pub struct CountersSnapshot {
    pub recorded: [(OperationClass, u64); 4],
    pub failures: [(OperationClass, u64); 4],
    pub rows_purged: [(OperationClass, u64); 4],
    pub records_written: u64,
    pub write_retries: u64,
    pub dropped_metrics: u64,
    pub recording_errors: u64,
}

impl CountersSnapshot {
    /// Total records emitted across all classes
    pub fn total_recorded(&self) -> u64 {
        self.recorded.iter().map(|(_, n)| n).sum()
    }

    /// Total failure records across all classes
    pub fn total_failures(&self) -> u64 {
        self.failures.iter().map(|(_, n)| n).sum()
    }

    /// Records emitted for one class
    pub fn recorded_for(&self, class: OperationClass) -> u64 {
        self.recorded[class_index(class)].1
    }

    /// Fraction of emitted records that never reached the store
    pub fn drop_rate(&self) -> f64 {
        let total = self.total_recorded();
        if total == 0 {
            0.0
        } else {
            self.dropped_metrics as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_collection() {
        let counters = TelemetryCounters::new();

        counters.record_emitted(OperationClass::Encryption, true);
        counters.record_emitted(OperationClass::Encryption, false);
        counters.record_emitted(OperationClass::AuditLog, true);
        counters.record_dropped();
        counters.record_purged(OperationClass::KeyRotation, 7);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total_recorded(), 3);
        assert_eq!(snapshot.total_failures(), 1);
        assert_eq!(snapshot.recorded_for(OperationClass::Encryption), 2);
        assert_eq!(snapshot.rows_purged[3], (OperationClass::KeyRotation, 7));
        assert_eq!(snapshot.dropped_metrics, 1);
        assert!((snapshot.drop_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clones_share_state() {
        let counters = TelemetryCounters::new();
        let clone = counters.clone();
        clone.record_retry();
        assert_eq!(counters.snapshot().write_retries, 1);
    }
}
