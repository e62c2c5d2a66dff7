//! Vigil Core
//!
//! Core types and utilities shared across Vigil components.
//!
//! This crate provides:
//! - Immutable metric records for security operations, encryption, audit
//!   logging and key rotation
//! - Operation classes and their default latency thresholds
//! - Time windows, hourly buckets and monthly partition keys
//! - Error types and result handling

pub mod error;
pub mod types;
pub mod window;

pub use error::{Error, Result};
pub use types::{
    AuditLogMetric, CryptoOperation, EncryptionMetric, HealthSummary, KeyRotationMetric,
    Metadata, MetricRecord, OperationClass, OperationMetric, SummaryKind,
};
pub use window::{days_before, hour_bucket, saturating_sub, PartitionKey, TimeWindow};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{MetricRecord, OperationClass};
    pub use crate::window::TimeWindow;
}
