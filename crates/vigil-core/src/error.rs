//! Error types for Vigil

/// Result type alias using Vigil's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Vigil telemetry operations
///
/// None of these ever wrap the error of an instrumented business operation;
/// those are handed back to the caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A measurement could not be turned into a record (logged and dropped)
    #[error("measurement recording error: {0}")]
    MeasurementRecording(String),

    /// The store rejected an append
    #[error("sink write error: {0}")]
    SinkWrite(String),

    /// A windowed read against the store failed
    #[error("aggregation query error: {0}")]
    AggregationQuery(String),

    /// Compliance policies could not be evaluated
    #[error("compliance evaluation error: {0}")]
    ComplianceEvaluation(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An execution budget ran out
    #[error("operation timed out")]
    Timeout,

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new measurement recording error
    pub fn recording(msg: impl Into<String>) -> Self {
        Self::MeasurementRecording(msg.into())
    }

    /// Create a new sink write error
    pub fn sink_write(msg: impl Into<String>) -> Self {
        Self::SinkWrite(msg.into())
    }

    /// Create a new aggregation query error
    pub fn aggregation(msg: impl Into<String>) -> Self {
        Self::AggregationQuery(msg.into())
    }

    /// Create a new compliance evaluation error
    pub fn compliance(msg: impl Into<String>) -> Self {
        Self::ComplianceEvaluation(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same write could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkWrite(_) | Self::Io(_) | Self::Timeout)
    }
}
