//! Composite health scoring
//!
//! Reduces per-class window statistics to one 0–100 score:
//!
//! ```text
//! class = 100 × success_rate
//!             × (0.25 + 0.75 × within_threshold)
//!             × (1 − 0.5 × min(recent_failures / error_budget, 1))
//! score = Σ class × operations / Σ operations
//! ```
//!
//! An empty window scores 100. The last report is cached; readers never
//! trigger a recompute and get a staleness flag instead.

use crate::aggregate::{Aggregator, ClassWindowStats};
use crate::summary::SummaryTable;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::{Error, OperationClass, Result, SummaryKind, TimeWindow};

/// Share of a class score that latency can never take away
const LATENCY_FLOOR: f64 = 0.25;

/// Largest share of a class score recent errors can take away
const ERROR_PENALTY: f64 = 0.5;

/// Latency thresholds per operation class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_security_operation_ms")]
    pub security_operation_ms: f64,
    #[serde(default = "default_encryption_ms")]
    pub encryption_ms: f64,
    #[serde(default = "default_audit_log_ms")]
    pub audit_log_ms: f64,
    #[serde(default = "default_key_rotation_ms")]
    pub key_rotation_ms: f64,
}

impl ThresholdConfig {
    pub fn for_class(&self, class: OperationClass) -> f64 {
        match class {
            OperationClass::SecurityOperation => self.security_operation_ms,
            OperationClass::Encryption => self.encryption_ms,
            OperationClass::AuditLog => self.audit_log_ms,
            OperationClass::KeyRotation => self.key_rotation_ms,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            security_operation_ms: default_security_operation_ms(),
            encryption_ms: default_encryption_ms(),
            audit_log_ms: default_audit_log_ms(),
            key_rotation_ms: default_key_rotation_ms(),
        }
    }
}

fn default_security_operation_ms() -> f64 {
    OperationClass::SecurityOperation.default_threshold_ms()
}

fn default_encryption_ms() -> f64 {
    OperationClass::Encryption.default_threshold_ms()
}

fn default_audit_log_ms() -> f64 {
    OperationClass::AuditLog.default_threshold_ms()
}

fn default_key_rotation_ms() -> f64 {
    OperationClass::KeyRotation.default_threshold_ms()
}

/// Health scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Rolling window scored, in hours
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,

    /// Sub-window whose failures count as recent error volume
    #[serde(default = "default_recent_error_minutes")]
    pub recent_error_minutes: i64,

    /// Recent failures per class that cost the full error penalty
    #[serde(default = "default_error_budget")]
    pub error_budget: u64,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Seconds between background recomputes
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Execution budget of one recompute
    #[serde(default = "default_compute_budget_ms")]
    pub compute_budget_ms: u64,

    /// Age after which a cached report is flagged stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            recent_error_minutes: default_recent_error_minutes(),
            error_budget: default_error_budget(),
            thresholds: ThresholdConfig::default(),
            refresh_interval_secs: default_refresh_interval_secs(),
            compute_budget_ms: default_compute_budget_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_window_hours() -> i64 {
    24
}

fn default_recent_error_minutes() -> i64 {
    60
}

fn default_error_budget() -> u64 {
    10
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_compute_budget_ms() -> u64 {
    2_000
}

fn default_stale_after_secs() -> i64 {
    120
}

/// Coarse health derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Healthy
        } else if score >= 70.0 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// Per-class slice of a health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassHealth {
    pub class: OperationClass,
    pub score: f64,
    pub operations: u64,
    pub success_rate: f64,
    pub within_threshold_rate: f64,
    pub recent_failures: u64,
    pub threshold_ms: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub no_data: bool,
}

/// Body of the health endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: f64,
    pub status: HealthStatus,
    pub per_class_breakdown: Vec<ClassHealth>,
    pub last_updated: Option<DateTime<Utc>>,
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Placeholder before the first successful computation
    fn pending(error: Option<String>) -> Self {
        Self {
            score: 0.0,
            status: HealthStatus::Unknown,
            per_class_breakdown: Vec::new(),
            last_updated: None,
            stale: true,
            error,
        }
    }
}

/// Score one class
pub fn class_score(stats: &ClassWindowStats, error_budget: u64) -> f64 {
    if stats.is_empty() {
        return 100.0;
    }
    let latency_factor = LATENCY_FLOOR + (1.0 - LATENCY_FLOOR) * stats.within_threshold_ratio();
    let error_load = if error_budget == 0 {
        if stats.recent_failures > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        (stats.recent_failures as f64 / error_budget as f64).min(1.0)
    };
    let error_factor = 1.0 - ERROR_PENALTY * error_load;

    (100.0 * stats.success_ratio() * latency_factor * error_factor).clamp(0.0, 100.0)
}

/// Combine class statistics into a report body (score, status, breakdown)
pub fn score_classes(
    stats: &[ClassWindowStats],
    config: &HealthConfig,
) -> (f64, HealthStatus, Vec<ClassHealth>) {
    let mut weighted = 0.0;
    let mut operations = 0u64;

    let breakdown: Vec<ClassHealth> = stats
        .iter()
        .map(|s| {
            let score = class_score(s, config.error_budget);
            weighted += score * s.count as f64;
            operations += s.count;
            ClassHealth {
                class: s.class,
                score,
                operations: s.count,
                success_rate: s.success_ratio() * 100.0,
                within_threshold_rate: s.within_threshold_ratio() * 100.0,
                recent_failures: s.recent_failures,
                threshold_ms: config.thresholds.for_class(s.class),
                avg_duration_ms: s.avg_duration_ms,
                p95_duration_ms: s.p95_duration_ms,
                no_data: s.is_empty(),
            }
        })
        .collect();

    let score = if operations == 0 {
        100.0
    } else {
        (weighted / operations as f64).clamp(0.0, 100.0)
    };

    (score, HealthStatus::from_score(score), breakdown)
}

struct Cached {
    report: HealthReport,
    /// Set when the latest refresh failed or timed out
    degraded: Option<String>,
}

/// Cached health scorer
pub struct HealthScorer {
    aggregator: Aggregator,
    config: HealthConfig,
    summaries: Arc<SummaryTable>,
    cache: RwLock<Option<Cached>>,
}

impl HealthScorer {
    pub fn new(aggregator: Aggregator, config: HealthConfig, summaries: Arc<SummaryTable>) -> Self {
        Self {
            aggregator,
            config,
            summaries,
            cache: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Compute a fresh report for the window ending at `now`
    pub fn compute(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let window = TimeWindow::last_hours(now, self.config.window_hours);
        let recent = TimeWindow::last_minutes(now, self.config.recent_error_minutes);

        let stats = OperationClass::ALL
            .iter()
            .map(|class| {
                self.aggregator.class_stats(
                    *class,
                    &window,
                    self.config.thresholds.for_class(*class),
                    &recent,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let (score, status, per_class_breakdown) = score_classes(&stats, &self.config);
        Ok(HealthReport {
            score,
            status,
            per_class_breakdown,
            last_updated: Some(now),
            stale: false,
            error: None,
        })
    }

    /// Recompute, cache and publish the summary row; keeps the last good
    /// report on failure
    pub fn refresh_at(&self, now: DateTime<Utc>) -> HealthReport {
        match self.compute(now) {
            Ok(report) => {
                self.store(report);
                self.current_at(now)
            }
            Err(e) => self.record_failure(e, now),
        }
    }

    /// Recompute under the execution budget without blocking the runtime
    pub async fn refresh(self: &Arc<Self>) -> HealthReport {
        let budget = std::time::Duration::from_millis(self.config.compute_budget_ms);
        let scorer = Arc::clone(self);
        let now = Utc::now();

        let task = tokio::task::spawn_blocking(move || scorer.compute(now));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(Ok(report))) => {
                self.store(report);
                self.current()
            }
            Ok(Ok(Err(e))) => self.record_failure(e, Utc::now()),
            Ok(Err(join_err)) => {
                self.record_failure(Error::internal(join_err.to_string()), Utc::now())
            }
            Err(_) => self.record_failure(Error::Timeout, Utc::now()),
        }
    }

    /// Last known report with staleness evaluated now
    pub fn current(&self) -> HealthReport {
        self.current_at(Utc::now())
    }

    /// Last known report with staleness evaluated at `now`
    pub fn current_at(&self, now: DateTime<Utc>) -> HealthReport {
        let cache = self.cache.read();
        let Some(cached) = cache.as_ref() else {
            return HealthReport::pending(None);
        };

        let mut report = cached.report.clone();
        let too_old = report.last_updated.is_some_and(|t| {
            Duration::try_seconds(self.config.stale_after_secs).map_or(false, |limit| now - t > limit)
        });
        report.stale = too_old || cached.degraded.is_some();
        report.error = cached.degraded.clone();
        report
    }

    /// Run `refresh` on a fixed interval until the task is aborted
    pub fn spawn_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let report = self.refresh().await;
                debug!(
                    score = report.score,
                    status = report.status.as_str(),
                    stale = report.stale,
                    "Health score refreshed"
                );
            }
        })
    }

    /// Cache a computed report unless a newer one is already cached
    fn store(&self, report: HealthReport) {
        {
            let mut cache = self.cache.write();
            if let Some(cached) = cache.as_ref() {
                if cached.report.last_updated > report.last_updated {
                    debug!("Discarding health report computed before the cached one");
                    return;
                }
            }
            *cache = Some(Cached {
                report: report.clone(),
                degraded: None,
            });
        }

        if let Some(at) = report.last_updated {
            match serde_json::to_value(&report) {
                Ok(value) => {
                    if let Err(e) = self.summaries.upsert(SummaryKind::SystemHealthScore, value, at) {
                        warn!("Failed to write health summary: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode health summary: {}", e),
            }
        }

        if report.status != HealthStatus::Healthy {
            info!(
                score = report.score,
                status = report.status.as_str(),
                "Security subsystem health below healthy"
            );
        }
    }

    fn record_failure(&self, error: Error, now: DateTime<Utc>) -> HealthReport {
        warn!("Health score computation failed, serving last known score: {}", error);
        let message = error.to_string();

        {
            let mut cache = self.cache.write();
            match cache.as_mut() {
                Some(cached) => cached.degraded = Some(message.clone()),
                None => return HealthReport::pending(Some(message)),
            }
        }
        self.current_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultyStore, MemoryStore, MetricStore};
    use vigil_core::{MetricRecord, OperationMetric};

    fn stats(class: OperationClass, count: u64, ok: u64, within: u64, recent: u64) -> ClassWindowStats {
        ClassWindowStats {
            class,
            count,
            success_count: ok,
            failure_count: count - ok,
            within_threshold: within,
            recent_failures: recent,
            avg_duration_ms: 0.0,
            p95_duration_ms: 0.0,
            max_duration_ms: 0.0,
        }
    }

    #[test]
    fn test_perfect_class_scores_100() {
        let s = stats(OperationClass::Encryption, 10, 10, 10, 0);
        assert_eq!(class_score(&s, 10), 100.0);
    }

    #[test]
    fn test_threshold_violations_lower_score() {
        // 5 operations, 3 over threshold, all successful
        let s = stats(OperationClass::SecurityOperation, 5, 5, 2, 0);
        let score = class_score(&s, 10);
        assert!((score - 55.0).abs() < 1e-9);
        assert_eq!(HealthStatus::from_score(score), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_recent_errors_penalize() {
        let s = stats(OperationClass::AuditLog, 20, 15, 20, 5);
        // 75 × 1.0 × (1 − 0.5 × 0.5)
        assert!((class_score(&s, 10) - 56.25).abs() < 1e-9);

        let flood = stats(OperationClass::AuditLog, 20, 15, 20, 50);
        assert!((class_score(&flood, 10) - 37.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_healthy() {
        let all_empty: Vec<_> = OperationClass::ALL
            .iter()
            .map(|c| stats(*c, 0, 0, 0, 0))
            .collect();
        let (score, status, breakdown) = score_classes(&all_empty, &HealthConfig::default());
        assert_eq!(score, 100.0);
        assert_eq!(status, HealthStatus::Healthy);
        assert!(breakdown.iter().all(|c| c.no_data));
    }

    #[test]
    fn test_composite_is_count_weighted() {
        let mixed = vec![
            stats(OperationClass::Encryption, 30, 30, 30, 0),
            stats(OperationClass::SecurityOperation, 10, 5, 10, 0),
            stats(OperationClass::AuditLog, 0, 0, 0, 0),
        ];
        let (score, _, _) = score_classes(&mixed, &HealthConfig::default());
        // (100 × 30 + 50 × 10) / 40
        assert!((score - 87.5).abs() < 1e-9);
    }

    #[test]
    fn test_cached_report_goes_stale() {
        let store: Arc<dyn MetricStore> = Arc::new(MemoryStore::new());
        let record: MetricRecord = OperationMetric::new("login", 20.0, true).into();
        store.append(record).unwrap();

        let scorer = HealthScorer::new(
            Aggregator::new(store),
            HealthConfig::default(),
            Arc::new(SummaryTable::in_memory()),
        );
        assert_eq!(scorer.current().status, HealthStatus::Unknown);

        let now = Utc::now() + Duration::seconds(1);
        let fresh = scorer.refresh_at(now);
        assert!(!fresh.stale);
        assert_eq!(fresh.score, 100.0);

        let later = scorer.current_at(now + Duration::minutes(10));
        assert!(later.stale);
        assert_eq!(later.score, 100.0);
    }

    fn faulty_scorer(budget_ms: u64) -> (Arc<HealthScorer>, Arc<FaultyStore>) {
        let store = Arc::new(FaultyStore::new());
        store
            .append(OperationMetric::new("login", 20.0, true).into())
            .unwrap();
        let config = HealthConfig {
            compute_budget_ms: budget_ms,
            ..HealthConfig::default()
        };
        let scorer = HealthScorer::new(
            Aggregator::new(store.clone()),
            config,
            Arc::new(SummaryTable::in_memory()),
        );
        (Arc::new(scorer), store)
    }

    #[tokio::test]
    async fn test_failed_refresh_without_cache_is_unknown() {
        let (scorer, store) = faulty_scorer(2_000);
        store.set_failing(true);

        let report = scorer.refresh().await;
        assert_eq!(report.status, HealthStatus::Unknown);
        assert!(report.stale);
        assert!(report.last_updated.is_none());
        assert!(report.error.unwrap().contains("storage volume offline"));
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_last_good_score() {
        let (scorer, store) = faulty_scorer(2_000);
        let good = scorer.refresh().await;
        assert_eq!(good.status, HealthStatus::Healthy);
        assert!(!good.stale);

        store.set_failing(true);
        let degraded = scorer.refresh().await;
        assert_eq!(degraded.score, good.score);
        assert_eq!(degraded.last_updated, good.last_updated);
        assert!(degraded.stale);
        assert!(degraded
            .error
            .as_deref()
            .unwrap()
            .starts_with("aggregation query error"));
        assert!(scorer.current().stale);

        store.set_failing(false);
        let recovered = scorer.refresh().await;
        assert!(!recovered.stale);
        assert!(recovered.error.is_none());
    }

    #[tokio::test]
    async fn test_refresh_over_budget_serves_last_good_score() {
        let (scorer, store) = faulty_scorer(200);
        let good = scorer.refresh().await;
        assert!(!good.stale);

        store.set_read_delay(std::time::Duration::from_millis(600));
        let late = scorer.refresh().await;
        assert_eq!(late.score, good.score);
        assert_eq!(late.last_updated, good.last_updated);
        assert!(late.stale);
        assert_eq!(late.error, Some(Error::Timeout.to_string()));
    }

    #[test]
    fn test_older_report_never_replaces_newer() {
        let store: Arc<dyn MetricStore> = Arc::new(MemoryStore::new());
        let scorer = HealthScorer::new(
            Aggregator::new(store),
            HealthConfig::default(),
            Arc::new(SummaryTable::in_memory()),
        );
        let newer = Utc::now();
        let older = newer - Duration::seconds(30);

        scorer.refresh_at(newer);
        let report = scorer.refresh_at(older);
        assert_eq!(report.last_updated, Some(newer));
        assert_eq!(scorer.current_at(newer).last_updated, Some(newer));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn score_always_in_range(
                count in 0u64..500,
                ok_frac in 0.0f64..=1.0,
                within_frac in 0.0f64..=1.0,
                recent in 0u64..100,
                budget in 0u64..20,
            ) {
                let ok = (count as f64 * ok_frac) as u64;
                let within = (count as f64 * within_frac) as u64;
                let s = stats(OperationClass::KeyRotation, count, ok, within, recent);
                let score = class_score(&s, budget);
                prop_assert!((0.0..=100.0).contains(&score));
            }
        }
    }
}
