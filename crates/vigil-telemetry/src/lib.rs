//! Vigil Telemetry
//!
//! Security and performance telemetry for security-sensitive operations.
//!
//! Provides:
//! - Scoped measurement that records exactly one outcome per operation
//! - A non-blocking metric sink over monthly-partitioned fact tables
//! - Rolling hourly aggregation, composite health scoring and a tri-state
//!   compliance check
//! - Age-based retention and a read-only exporter for the `metrics` facade

pub mod aggregate;
pub mod compliance;
pub mod config;
pub mod counters;
pub mod exporter;
pub mod health;
pub mod measure;
pub mod persistence;
pub mod pipeline;
pub mod retention;
pub mod sink;
pub mod store;
pub mod summary;

pub use aggregate::{Aggregator, ClassWindowStats, HourlyRollup};
pub use compliance::{
    ComplianceChecker, ComplianceConfig, CompliancePolicy, ComplianceReport, ComplianceStatus,
    PolicyResult,
};
pub use config::{MonitoringConfig, StorageBackend, StorageConfig, TelemetryConfig};
pub use counters::{CountersSnapshot, TelemetryCounters};
pub use exporter::Exporter;
pub use health::{ClassHealth, HealthConfig, HealthReport, HealthScorer, HealthStatus};
pub use measure::{MeasurementScope, SecurityMonitor};
pub use persistence::{JsonlStore, PersistenceConfig};
pub use pipeline::{BackgroundTasks, TelemetryPipeline};
pub use retention::{CleanupReport, Retention, RetentionConfig};
pub use sink::{MetricSink, SinkConfig};
pub use store::{MemoryStore, MetricStore};
pub use summary::SummaryTable;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::measure::{MeasurementScope, SecurityMonitor};
    pub use crate::pipeline::TelemetryPipeline;
    pub use vigil_core::{CryptoOperation, Metadata};
}
