//! Telemetry pipeline configuration

use crate::compliance::ComplianceConfig;
use crate::health::HealthConfig;
use crate::persistence::PersistenceConfig;
use crate::retention::RetentionConfig;
use crate::sink::SinkConfig;
use serde::{Deserialize, Serialize};
use vigil_core::{Error, Result};

/// Longest span, in days, any window or retention setting may cover
pub const MAX_SPAN_DAYS: i64 = 100 * 366;

/// Telemetry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub compliance: ComplianceConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl TelemetryConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sink.queue_capacity == 0 {
            return Err(Error::config("sink.queue_capacity must be positive"));
        }
        check_span("health.window_hours", self.health.window_hours, MAX_SPAN_DAYS * 24)?;
        check_span(
            "health.recent_error_minutes",
            self.health.recent_error_minutes,
            MAX_SPAN_DAYS * 24 * 60,
        )?;
        check_span(
            "health.stale_after_secs",
            self.health.stale_after_secs,
            MAX_SPAN_DAYS * 24 * 3600,
        )?;
        check_span(
            "compliance.rotation_interval_days",
            self.compliance.rotation_interval_days,
            MAX_SPAN_DAYS,
        )?;
        check_span(
            "compliance.audit_gap_minutes",
            self.compliance.audit_gap_minutes,
            MAX_SPAN_DAYS * 24 * 60,
        )?;
        check_span(
            "compliance.evaluation_window_hours",
            self.compliance.evaluation_window_hours,
            MAX_SPAN_DAYS * 24,
        )?;
        check_span(
            "compliance.encryption_window_hours",
            self.compliance.encryption_window_hours,
            MAX_SPAN_DAYS * 24,
        )?;
        if self.retention.days_to_keep < 0 {
            return Err(Error::config("retention.days_to_keep must not be negative"));
        }
        if self.retention.days_to_keep > MAX_SPAN_DAYS {
            return Err(Error::config(format!(
                "retention.days_to_keep must be at most {}",
                MAX_SPAN_DAYS
            )));
        }
        Ok(())
    }

    /// Rotation history kept for less than the rotation interval cannot
    /// prove a key was rotated in time
    pub fn retention_shorter_than_rotation(&self) -> bool {
        self.retention.enabled && self.retention.days_to_keep < self.compliance.rotation_interval_days
    }
}

/// Measurement switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// When disabled, scopes measure nothing and emit nothing
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Where fact tables live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory only
    #[default]
    Memory,

    /// JSON-lines files, one per table and month
    Jsonl,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn check_span(name: &str, value: i64, max: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::config(format!("{} must be positive", name)));
    }
    if value > max {
        return Err(Error::config(format!("{} must be at most {}", name, max)));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert!(config.monitoring.enabled);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.retention.days_to_keep, 30);
        assert_eq!(config.compliance.rotation_interval_days, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TelemetryConfig = serde_json::from_str(
            r#"{"storage": {"backend": "jsonl", "persistence": {"data_dir": "/var/lib/vigil"}},
                "health": {"error_budget": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Jsonl);
        assert_eq!(config.storage.persistence.flush_interval, 16);
        assert_eq!(config.health.error_budget, 5);
        assert_eq!(config.health.window_hours, 24);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = TelemetryConfig::default();
        config.sink.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_out_of_range_spans_rejected() {
        let mut config = TelemetryConfig::default();
        config.retention.days_to_keep = i64::MAX / 1000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TelemetryConfig::default();
        config.health.window_hours = i64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TelemetryConfig::default();
        config.compliance.rotation_interval_days = MAX_SPAN_DAYS + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TelemetryConfig::default();
        config.retention.days_to_keep = MAX_SPAN_DAYS;
        config.compliance.rotation_interval_days = MAX_SPAN_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_retention_flagged() {
        let config = TelemetryConfig::default();
        assert!(config.retention_shorter_than_rotation());
    }
}
