//! Scoped measurement of security-sensitive operations
//!
//! A `MeasurementScope` is acquired before the business operation runs and
//! emits exactly one record when it ends, whichever way it ends:
//!
//! - `run` / `run_async` record the outcome of the returned `Result` and hand
//!   the original value or error back untouched
//! - `complete` / `fail` record an explicit outcome
//! - dropping an unfinished scope (early return, panic, cancelled future)
//!   records a failure
//!
//! Recording is best-effort. A full queue or stopped writer is logged and
//! counted, never surfaced to the business caller.

use crate::counters::TelemetryCounters;
use crate::sink::MetricSink;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{trace, warn};
use vigil_core::{
    AuditLogMetric, CryptoOperation, EncryptionMetric, KeyRotationMetric, Metadata,
    MetricRecord, OperationMetric,
};

/// Wall clock that never goes backwards for a single producer
struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let micros = wall.timestamp_micros();
        let prev = self.last_micros.fetch_max(micros, Ordering::SeqCst);
        if prev <= micros {
            return wall;
        }
        let secs = prev.div_euclid(1_000_000);
        let nanos = (prev.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or(wall)
    }
}

/// Entry point for instrumenting business code.
///
/// Constructed once per process and cloned into call sites.
#[derive(Clone)]
pub struct SecurityMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    sink: Arc<MetricSink>,
    clock: MonotonicClock,
    enabled: bool,
}

impl SecurityMonitor {
    /// Create a monitor emitting into `sink`
    pub fn new(sink: Arc<MetricSink>) -> Self {
        Self::with_enabled(sink, true)
    }

    /// Create a monitor; when disabled, scopes time nothing and emit nothing
    pub fn with_enabled(sink: Arc<MetricSink>, enabled: bool) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                sink,
                clock: MonotonicClock::new(),
                enabled,
            }),
        }
    }

    /// Measure a general security operation
    pub fn measure(&self, operation_type: impl Into<String>, metadata: Metadata) -> MeasurementScope {
        self.scope(
            ScopeKind::Operation {
                operation_type: operation_type.into(),
            },
            metadata,
        )
    }

    /// Measure an encrypt/decrypt call
    pub fn measure_encryption(
        &self,
        algorithm: impl Into<String>,
        key_size: u32,
        operation: CryptoOperation,
        data_size_bytes: u64,
    ) -> MeasurementScope {
        self.scope(
            ScopeKind::Encryption {
                algorithm: algorithm.into(),
                key_size,
                operation,
                data_size_bytes,
            },
            Metadata::new(),
        )
    }

    /// Measure an audit log write
    pub fn measure_audit_log(
        &self,
        operation_type: impl Into<String>,
        log_size_bytes: u64,
        batch_size: Option<u32>,
    ) -> MeasurementScope {
        self.scope(
            ScopeKind::AuditLog {
                operation_type: operation_type.into(),
                log_size_bytes,
                batch_size,
            },
            Metadata::new(),
        )
    }

    /// Measure a credential key rotation
    pub fn measure_key_rotation(
        &self,
        key_type: impl Into<String>,
        old_key_id: impl Into<String>,
        new_key_id: impl Into<String>,
    ) -> MeasurementScope {
        self.scope(
            ScopeKind::KeyRotation {
                key_type: key_type.into(),
                old_key_id: old_key_id.into(),
                new_key_id: new_key_id.into(),
                affected_entities: 0,
            },
            Metadata::new(),
        )
    }

    /// Wait for queued records to reach the store
    pub async fn flush(&self) {
        self.inner.sink.flush().await;
    }

    pub fn counters(&self) -> &TelemetryCounters {
        self.inner.sink.counters()
    }

    pub fn sink(&self) -> &Arc<MetricSink> {
        &self.inner.sink
    }

    fn scope(&self, kind: ScopeKind, metadata: Metadata) -> MeasurementScope {
        MeasurementScope {
            monitor: self.clone(),
            started: Instant::now(),
            kind,
            metadata,
            finished: !self.inner.enabled,
        }
    }

    fn emit(&self, record: MetricRecord) {
        let class = record.class();
        let success = record.success();

        match self.inner.sink.record(record) {
            Ok(()) => {
                self.counters().record_emitted(class, success);
                trace!(class = %class, success, "Metric record queued");
            }
            Err(e) => {
                self.counters().record_recording_error();
                warn!(class = %class, "Failed to record measurement: {}", e);
            }
        }
    }
}

enum ScopeKind {
    Operation {
        operation_type: String,
    },
    Encryption {
        algorithm: String,
        key_size: u32,
        operation: CryptoOperation,
        data_size_bytes: u64,
    },
    AuditLog {
        operation_type: String,
        log_size_bytes: u64,
        batch_size: Option<u32>,
    },
    KeyRotation {
        key_type: String,
        old_key_id: String,
        new_key_id: String,
        affected_entities: u64,
    },
}

struct Failure {
    error_type: String,
    message: String,
}

/// An in-flight measurement; emits exactly one record
#[must_use = "a scope measures until it is completed, failed or dropped"]
pub struct MeasurementScope {
    monitor: SecurityMonitor,
    started: Instant,
    kind: ScopeKind,
    metadata: Metadata,
    finished: bool,
}

impl MeasurementScope {
    /// Attach metadata discovered while the operation runs
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Number of entities re-keyed by a rotation; ignored for other kinds
    pub fn set_affected_entities(&mut self, count: u64) -> &mut Self {
        if let ScopeKind::KeyRotation {
            affected_entities, ..
        } = &mut self.kind
        {
            *affected_entities = count;
        }
        self
    }

    /// End the scope successfully
    pub fn complete(mut self) {
        self.finish(None);
    }

    /// End the scope with a failure
    pub fn fail<E: Display + ?Sized>(mut self, error: &E) {
        self.finish(Some(Failure {
            error_type: short_type_name::<E>(),
            message: error.to_string(),
        }));
    }

    /// Run a closure inside the scope, recording its outcome.
    ///
    /// The closure's value or error is returned exactly as produced.
    pub fn run<T, E, F>(self, f: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let result = f();
        match &result {
            Ok(_) => self.complete(),
            Err(e) => self.fail(e),
        }
        result
    }

    /// Await a future inside the scope, recording its outcome.
    ///
    /// Dropping the returned future before it resolves records a failure.
    pub async fn run_async<T, E, Fut>(self, fut: Fut) -> Result<T, E>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = fut.await;
        match &result {
            Ok(_) => self.complete(),
            Err(e) => self.fail(e),
        }
        result
    }

    fn finish(&mut self, failure: Option<Failure>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let timestamp = self.monitor.inner.clock.now();
        let success = failure.is_none();
        let (error_type, message) = match failure {
            Some(f) => (Some(f.error_type), Some(f.message)),
            None => (None, None),
        };

        let record: MetricRecord = match &self.kind {
            ScopeKind::Operation { operation_type } => {
                let metadata = std::mem::take(&mut self.metadata);
                let mut metric = OperationMetric::new(operation_type.clone(), duration_ms, success)
                    .with_metadata(metadata)
                    .at(timestamp);
                metric.error_message = message;
                metric.error_type = error_type;
                metric.into()
            }
            ScopeKind::Encryption {
                algorithm,
                key_size,
                operation,
                data_size_bytes,
            } => {
                let mut metric = EncryptionMetric::new(
                    algorithm.clone(),
                    *key_size,
                    *operation,
                    *data_size_bytes,
                    duration_ms,
                    success,
                )
                .at(timestamp);
                metric.error_message = message;
                metric.error_type = error_type;
                metric.into()
            }
            ScopeKind::AuditLog {
                operation_type,
                log_size_bytes,
                batch_size,
            } => {
                let mut metric = AuditLogMetric::new(
                    operation_type.clone(),
                    *log_size_bytes,
                    *batch_size,
                    duration_ms,
                    success,
                )
                .at(timestamp);
                metric.error_message = message;
                metric.error_type = error_type;
                metric.into()
            }
            ScopeKind::KeyRotation {
                key_type,
                old_key_id,
                new_key_id,
                affected_entities,
            } => {
                let mut metric = KeyRotationMetric::new(
                    key_type.clone(),
                    old_key_id.clone(),
                    new_key_id.clone(),
                    duration_ms,
                    success,
                )
                .with_affected_entities(*affected_entities)
                .at(timestamp);
                metric.error_message = message;
                metric.error_type = error_type;
                metric.into()
            }
        };

        self.monitor.emit(record);
    }
}

impl Drop for MeasurementScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let message = if std::thread::panicking() {
            "panicked"
        } else {
            "scope dropped before completion"
        };
        self.finish(Some(Failure {
            error_type: "abandoned".to_string(),
            message: message.to_string(),
        }));
    }
}

/// `std::io::error::Error` becomes `Error`, `anyhow::Error` stays `Error`
fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
