//! Age-based pruning of the fact tables

use crate::counters::TelemetryCounters;
use crate::store::MetricStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vigil_core::{days_before, Error, OperationClass, Result};

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Run the periodic cleanup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Records older than this many days are deleted
    #[serde(default = "default_days_to_keep")]
    pub days_to_keep: i64,

    /// Seconds between scheduled cleanups
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            days_to_keep: default_days_to_keep(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_days_to_keep() -> i64 {
    30
}

fn default_interval_secs() -> u64 {
    3600
}

/// Rows deleted by one cleanup run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub cutoff: DateTime<Utc>,
    pub days_to_keep: i64,
    /// Keyed by table name
    pub rows_deleted: BTreeMap<String, u64>,
    pub total: u64,
}

/// Deletes records older than a cutoff from every fact table
pub struct Retention {
    store: Arc<dyn MetricStore>,
    counters: TelemetryCounters,
    config: RetentionConfig,
}

impl Retention {
    pub fn new(store: Arc<dyn MetricStore>, counters: TelemetryCounters, config: RetentionConfig) -> Self {
        Self {
            store,
            counters,
            config,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Delete records older than `days_to_keep` days from now
    pub fn cleanup(&self, days_to_keep: i64) -> Result<CleanupReport> {
        self.cleanup_at(Utc::now(), days_to_keep)
    }

    /// Delete records with `timestamp < now - days_to_keep`.
    ///
    /// A span reaching past the earliest representable instant keeps
    /// everything.
    pub fn cleanup_at(&self, now: DateTime<Utc>, days_to_keep: i64) -> Result<CleanupReport> {
        if days_to_keep < 0 {
            return Err(Error::config(format!(
                "days_to_keep must not be negative, got {}",
                days_to_keep
            )));
        }
        let cutoff = days_before(now, days_to_keep);

        let mut rows_deleted = BTreeMap::new();
        let mut total = 0;
        for class in OperationClass::ALL {
            let rows = self.store.purge_before(class, cutoff)?;
            self.counters.record_purged(class, rows);
            rows_deleted.insert(class.table().to_string(), rows);
            total += rows;
        }

        info!(
            cutoff = %cutoff,
            total,
            "Retention cleanup removed {} record(s)",
            total
        );

        Ok(CleanupReport {
            cutoff,
            days_to_keep,
            rows_deleted,
            total,
        })
    }

    /// Run the configured cleanup on a fixed interval until aborted
    pub fn spawn_schedule(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let retention = Arc::clone(&self);
                let days = self.config.days_to_keep;
                match tokio::task::spawn_blocking(move || retention.cleanup(days)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Scheduled retention cleanup failed: {}", e),
                    Err(e) => error!("Retention cleanup task panicked: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use vigil_core::{KeyRotationMetric, OperationMetric, TimeWindow};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 20, 9, 0, 0).unwrap()
    }

    fn rotation(days_ago: i64) -> vigil_core::MetricRecord {
        KeyRotationMetric::new("master_key", "a", "b", 1200.0, true)
            .at(now() - Duration::days(days_ago))
            .into()
    }

    #[test]
    fn test_cleanup_removes_only_old_rows() {
        let store = Arc::new(MemoryStore::new());
        store.append(rotation(40)).unwrap();
        store.append(rotation(10)).unwrap();
        store
            .append(OperationMetric::new("login", 5.0, true).at(now() - Duration::days(31)).into())
            .unwrap();

        let counters = TelemetryCounters::new();
        let retention = Retention::new(store.clone(), counters.clone(), RetentionConfig::default());
        let report = retention.cleanup_at(now(), 30).unwrap();

        assert_eq!(report.rows_deleted["key_rotation_metrics"], 1);
        assert_eq!(report.rows_deleted["security_operation_metrics"], 1);
        assert_eq!(report.rows_deleted["encryption_metrics"], 0);
        assert_eq!(report.total, 2);

        let left = store
            .scan(OperationClass::KeyRotation, &TimeWindow::before(now()))
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp(), now() - Duration::days(10));

        let purged: u64 = counters.snapshot().rows_purged.iter().map(|(_, n)| n).sum();
        assert_eq!(purged, 2);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.append(rotation(40)).unwrap();
        let retention = Retention::new(store, TelemetryCounters::new(), RetentionConfig::default());

        assert_eq!(retention.cleanup_at(now(), 30).unwrap().total, 1);
        assert_eq!(retention.cleanup_at(now(), 30).unwrap().total, 0);
    }

    #[test]
    fn test_negative_days_rejected() {
        let retention = Retention::new(
            Arc::new(MemoryStore::new()),
            TelemetryCounters::new(),
            RetentionConfig::default(),
        );
        assert!(matches!(retention.cleanup(-1), Err(Error::Config(_))));
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let store = Arc::new(MemoryStore::new());
        store.append(rotation(4000)).unwrap();
        let retention = Retention::new(store.clone(), TelemetryCounters::new(), RetentionConfig::default());

        let report = retention.cleanup(i64::MAX / 1000).unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.cutoff, DateTime::<Utc>::MIN_UTC);

        let report = retention.cleanup_at(now(), i64::MAX).unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(store.count(OperationClass::KeyRotation).unwrap(), 1);
    }
}
