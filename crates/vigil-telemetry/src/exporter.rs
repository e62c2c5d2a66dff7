//! Mirrors pipeline counters and derived state into the `metrics` facade
//!
//! The exporter only reads: counters are copied with `absolute`, health and
//! compliance come from the cached reports, and nothing is recomputed or
//! written back to the store.

use crate::compliance::{ComplianceChecker, CompliancePolicy, ComplianceStatus};
use crate::counters::TelemetryCounters;
use crate::health::HealthScorer;
use std::sync::Arc;
use tracing::debug;

pub const RECORDS_TOTAL: &str = "vigil_records_total";
pub const RECORD_SUCCESSES_TOTAL: &str = "vigil_record_successes_total";
pub const RECORD_FAILURES_TOTAL: &str = "vigil_record_failures_total";
pub const ROWS_PURGED_TOTAL: &str = "vigil_rows_purged_total";
pub const RECORDS_WRITTEN_TOTAL: &str = "vigil_records_written_total";
pub const WRITE_RETRIES_TOTAL: &str = "vigil_write_retries_total";
pub const DROPPED_METRICS_TOTAL: &str = "vigil_dropped_metrics_total";
pub const RECORDING_ERRORS_TOTAL: &str = "vigil_recording_errors_total";
pub const HEALTH_SCORE: &str = "vigil_health_score";
pub const CLASS_HEALTH_SCORE: &str = "vigil_class_health_score";
pub const HEALTH_STALE: &str = "vigil_health_stale";
pub const COMPLIANCE_STATUS: &str = "vigil_compliance_status";
pub const COMPLIANCE_POLICY_STATUS: &str = "vigil_compliance_policy_status";

/// Read-only bridge from the pipeline to the installed metrics recorder
#[derive(Clone)]
pub struct Exporter {
    counters: TelemetryCounters,
    health: Arc<HealthScorer>,
    compliance: Arc<ComplianceChecker>,
}

impl Exporter {
    pub fn new(
        counters: TelemetryCounters,
        health: Arc<HealthScorer>,
        compliance: Arc<ComplianceChecker>,
    ) -> Self {
        Self {
            counters,
            health,
            compliance,
        }
    }

    /// Register descriptions with the installed recorder
    pub fn describe() {
        metrics::describe_counter!(RECORDS_TOTAL, "Metric records emitted by class");
        metrics::describe_counter!(RECORD_SUCCESSES_TOTAL, "Successful operations recorded by class");
        metrics::describe_counter!(RECORD_FAILURES_TOTAL, "Failed operations recorded by class");
        metrics::describe_counter!(ROWS_PURGED_TOTAL, "Rows removed by retention by class");
        metrics::describe_counter!(RECORDS_WRITTEN_TOTAL, "Records persisted by the sink writer");
        metrics::describe_counter!(WRITE_RETRIES_TOTAL, "Store appends retried after a transient failure");
        metrics::describe_counter!(DROPPED_METRICS_TOTAL, "Records dropped by a full queue or exhausted retries");
        metrics::describe_counter!(RECORDING_ERRORS_TOTAL, "Measurements that could not be handed to the sink");
        metrics::describe_gauge!(HEALTH_SCORE, "Composite health score, 0-100");
        metrics::describe_gauge!(CLASS_HEALTH_SCORE, "Health score by operation class, 0-100");
        metrics::describe_gauge!(HEALTH_STALE, "1 when the cached health score is stale");
        metrics::describe_gauge!(
            COMPLIANCE_STATUS,
            "Compliance status: 1 compliant, 0 non_compliant, -1 unknown"
        );
        metrics::describe_gauge!(
            COMPLIANCE_POLICY_STATUS,
            "Per-policy compliance status: 1 compliant, 0 non_compliant, -1 unknown"
        );
    }

    /// Copy the current state into the recorder
    pub fn publish(&self) {
        let snapshot = self.counters.snapshot();

        for ((class, recorded), (_, failed)) in snapshot.recorded.iter().zip(snapshot.failures.iter()) {
            let label = class.as_str();
            metrics::counter!(RECORDS_TOTAL, "class" => label).absolute(*recorded);
            metrics::counter!(RECORD_SUCCESSES_TOTAL, "class" => label)
                .absolute(recorded.saturating_sub(*failed));
            metrics::counter!(RECORD_FAILURES_TOTAL, "class" => label).absolute(*failed);
        }
        for (class, purged) in snapshot.rows_purged.iter() {
            metrics::counter!(ROWS_PURGED_TOTAL, "class" => class.as_str()).absolute(*purged);
        }
        metrics::counter!(RECORDS_WRITTEN_TOTAL).absolute(snapshot.records_written);
        metrics::counter!(WRITE_RETRIES_TOTAL).absolute(snapshot.write_retries);
        metrics::counter!(DROPPED_METRICS_TOTAL).absolute(snapshot.dropped_metrics);
        metrics::counter!(RECORDING_ERRORS_TOTAL).absolute(snapshot.recording_errors);

        let health = self.health.current();
        metrics::gauge!(HEALTH_SCORE).set(health.score);
        metrics::gauge!(HEALTH_STALE).set(if health.stale { 1.0 } else { 0.0 });
        for class in &health.per_class_breakdown {
            metrics::gauge!(CLASS_HEALTH_SCORE, "class" => class.class.as_str()).set(class.score);
        }

        let compliance = self.compliance.current();
        metrics::gauge!(COMPLIANCE_STATUS).set(compliance.status.gauge_value());
        for policy in CompliancePolicy::ALL {
            let status = compliance
                .details
                .iter()
                .find(|d| d.policy == policy)
                .map_or(ComplianceStatus::Unknown, |d| d.status);
            metrics::gauge!(COMPLIANCE_POLICY_STATUS, "policy" => policy.as_str())
                .set(status.gauge_value());
        }

        debug!(
            health = health.score,
            compliance = compliance.status.as_str(),
            "Published telemetry metrics"
        );
    }
}
