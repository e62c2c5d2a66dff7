//! Core metric record types for Vigil

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque structured metadata attached to a record
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Category of instrumented work, each with its own latency threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// General security-sensitive operation
    SecurityOperation,
    /// Cryptographic transform
    Encryption,
    /// Audit log write
    AuditLog,
    /// Credential key rotation
    KeyRotation,
}

impl OperationClass {
    /// Every class, in table order
    pub const ALL: [OperationClass; 4] = [
        OperationClass::SecurityOperation,
        OperationClass::Encryption,
        OperationClass::AuditLog,
        OperationClass::KeyRotation,
    ];

    /// Stable label used in logs, exports and JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityOperation => "security_operation",
            Self::Encryption => "encryption",
            Self::AuditLog => "audit_log",
            Self::KeyRotation => "key_rotation",
        }
    }

    /// Name of the fact table holding this class
    pub fn table(&self) -> &'static str {
        match self {
            Self::SecurityOperation => "security_operation_metrics",
            Self::Encryption => "encryption_metrics",
            Self::AuditLog => "audit_log_metrics",
            Self::KeyRotation => "key_rotation_metrics",
        }
    }

    /// Default latency threshold in milliseconds
    pub fn default_threshold_ms(&self) -> f64 {
        match self {
            Self::SecurityOperation => 200.0,
            Self::Encryption => 100.0,
            Self::AuditLog => 50.0,
            Self::KeyRotation => 5000.0,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a cryptographic transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoOperation {
    Encrypt,
    Decrypt,
}

impl CryptoOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

impl fmt::Display for CryptoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CryptoOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "encrypt" => Ok(Self::Encrypt),
            "decrypt" => Ok(Self::Decrypt),
            other => Err(format!("unknown crypto operation: {}", other)),
        }
    }
}

/// Generate a unique record ID using UUID v4
pub fn generate_record_id() -> String {
    format!("met_{}", uuid::Uuid::new_v4())
}

/// Durations are never negative; NaN and negatives collapse to zero
pub fn clamp_duration_ms(duration_ms: f64) -> f64 {
    if duration_ms.is_finite() && duration_ms > 0.0 {
        duration_ms
    } else {
        0.0
    }
}

/// Outcome of a general security operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub id: String,
    pub operation_type: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Short type name of the error that failed the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl OperationMetric {
    /// Create a new record stamped now
    pub fn new(operation_type: impl Into<String>, duration_ms: f64, success: bool) -> Self {
        Self {
            id: generate_record_id(),
            operation_type: operation_type.into(),
            duration_ms: clamp_duration_ms(duration_ms),
            success,
            error_message: None,
            error_type: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the error message
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Replace the metadata map
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Outcome of an encrypt/decrypt call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMetric {
    pub id: String,
    pub algorithm: String,
    pub key_size: u32,
    pub operation: CryptoOperation,
    pub data_size_bytes: u64,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Short type name of the error that failed the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EncryptionMetric {
    pub fn new(
        algorithm: impl Into<String>,
        key_size: u32,
        operation: CryptoOperation,
        data_size_bytes: u64,
        duration_ms: f64,
        success: bool,
    ) -> Self {
        Self {
            id: generate_record_id(),
            algorithm: algorithm.into(),
            key_size,
            operation,
            data_size_bytes,
            duration_ms: clamp_duration_ms(duration_ms),
            success,
            error_message: None,
            error_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Outcome of an audit log write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogMetric {
    pub id: String,
    pub operation_type: String,
    pub duration_ms: f64,
    pub log_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Short type name of the error that failed the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogMetric {
    pub fn new(
        operation_type: impl Into<String>,
        log_size_bytes: u64,
        batch_size: Option<u32>,
        duration_ms: f64,
        success: bool,
    ) -> Self {
        Self {
            id: generate_record_id(),
            operation_type: operation_type.into(),
            duration_ms: clamp_duration_ms(duration_ms),
            log_size_bytes,
            batch_size,
            success,
            error_message: None,
            error_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Outcome of a credential key rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRotationMetric {
    pub id: String,
    pub key_type: String,
    pub old_key_id: String,
    pub new_key_id: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default)]
    pub affected_entities: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Short type name of the error that failed the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl KeyRotationMetric {
    pub fn new(
        key_type: impl Into<String>,
        old_key_id: impl Into<String>,
        new_key_id: impl Into<String>,
        duration_ms: f64,
        success: bool,
    ) -> Self {
        Self {
            id: generate_record_id(),
            key_type: key_type.into(),
            old_key_id: old_key_id.into(),
            new_key_id: new_key_id.into(),
            duration_ms: clamp_duration_ms(duration_ms),
            success,
            affected_entities: 0,
            error_message: None,
            error_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_affected_entities(mut self, count: u64) -> Self {
        self.affected_entities = count;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Any immutable fact row, tagged by the table it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricRecord {
    Operation(OperationMetric),
    Encryption(EncryptionMetric),
    AuditLog(AuditLogMetric),
    KeyRotation(KeyRotationMetric),
}

impl MetricRecord {
    pub fn class(&self) -> OperationClass {
        match self {
            Self::Operation(_) => OperationClass::SecurityOperation,
            Self::Encryption(_) => OperationClass::Encryption,
            Self::AuditLog(_) => OperationClass::AuditLog,
            Self::KeyRotation(_) => OperationClass::KeyRotation,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Operation(m) => &m.id,
            Self::Encryption(m) => &m.id,
            Self::AuditLog(m) => &m.id,
            Self::KeyRotation(m) => &m.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Operation(m) => m.timestamp,
            Self::Encryption(m) => m.timestamp,
            Self::AuditLog(m) => m.timestamp,
            Self::KeyRotation(m) => m.timestamp,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        match self {
            Self::Operation(m) => m.duration_ms,
            Self::Encryption(m) => m.duration_ms,
            Self::AuditLog(m) => m.duration_ms,
            Self::KeyRotation(m) => m.duration_ms,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            Self::Operation(m) => m.success,
            Self::Encryption(m) => m.success,
            Self::AuditLog(m) => m.success,
            Self::KeyRotation(m) => m.success,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Operation(m) => m.error_message.as_deref(),
            Self::Encryption(m) => m.error_message.as_deref(),
            Self::AuditLog(m) => m.error_message.as_deref(),
            Self::KeyRotation(m) => m.error_message.as_deref(),
        }
    }

    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Operation(m) => m.error_type.as_deref(),
            Self::Encryption(m) => m.error_type.as_deref(),
            Self::AuditLog(m) => m.error_type.as_deref(),
            Self::KeyRotation(m) => m.error_type.as_deref(),
        }
    }

    /// Value of the class dimension index.
    ///
    /// Encryption rolls up per algorithm × key size × direction, e.g.
    /// `AES-256-GCM/256/encrypt`.
    pub fn dimension(&self) -> String {
        match self {
            Self::Operation(m) => m.operation_type.clone(),
            Self::Encryption(m) => format!("{}/{}/{}", m.algorithm, m.key_size, m.operation),
            Self::AuditLog(m) => m.operation_type.clone(),
            Self::KeyRotation(m) => m.key_type.clone(),
        }
    }
}

impl From<OperationMetric> for MetricRecord {
    fn from(metric: OperationMetric) -> Self {
        Self::Operation(metric)
    }
}

impl From<EncryptionMetric> for MetricRecord {
    fn from(metric: EncryptionMetric) -> Self {
        Self::Encryption(metric)
    }
}

impl From<AuditLogMetric> for MetricRecord {
    fn from(metric: AuditLogMetric) -> Self {
        Self::AuditLog(metric)
    }
}

impl From<KeyRotationMetric> for MetricRecord {
    fn from(metric: KeyRotationMetric) -> Self {
        Self::KeyRotation(metric)
    }
}

/// Discriminator of a mutable summary row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    SystemHealthScore,
    PciComplianceStatus,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemHealthScore => "system_health_score",
            Self::PciComplianceStatus => "pci_compliance_status",
        }
    }
}

/// Current derived state, one row per metric type, overwritten on recompute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub metric_type: SummaryKind,
    pub value: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}
