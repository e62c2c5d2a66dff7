//! Metric sink for async record persistence
//!
//! Provides:
//! - A non-blocking `record` call for the measurement hot path
//! - A background writer that appends to the store with bounded retries
//! - Dropped-record accounting when the queue is full or retries run out
//! - Flush barriers for shutdown and tests

use crate::counters::TelemetryCounters;
use crate::store::MetricStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use vigil_core::{Error, MetricRecord, Result};

/// Configuration for the sink writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Records that may wait for the writer before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Retries after the first failed append
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    /// Backoff before the first retry, doubled on each further retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_write_retries: default_max_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

/// Commands sent to the background writer
enum SinkCommand {
    /// Append a record
    Record(Box<MetricRecord>),

    /// Flush the store and acknowledge
    Flush(oneshot::Sender<()>),

    /// Shutdown the writer
    Shutdown,
}

/// Front door of the metric store for producers
pub struct MetricSink {
    /// Channel sender for async record appends
    sender: mpsc::Sender<SinkCommand>,

    /// Store, shared with readers
    store: Arc<dyn MetricStore>,

    counters: TelemetryCounters,
}

impl MetricSink {
    /// Create a new sink and start its writer thread
    pub fn new(
        store: Arc<dyn MetricStore>,
        config: SinkConfig,
        counters: TelemetryCounters,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        let writer_store = Arc::clone(&store);
        let writer_counters = counters.clone();
        std::thread::Builder::new()
            .name("vigil-sink-writer".to_string())
            .spawn(move || {
                if let Err(e) = run_writer(writer_store, config, writer_counters, receiver) {
                    error!("Metric sink writer thread failed: {}", e);
                }
            })?;

        info!("Metric sink started");

        Ok(Self {
            sender,
            store,
            counters,
        })
    }

    /// Queue a record without blocking.
    ///
    /// A full or closed queue drops the record and counts it; the caller
    /// gets the error only so it can log it.
    pub fn record(&self, record: MetricRecord) -> Result<()> {
        match self.sender.try_send(SinkCommand::Record(Box::new(record))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.record_dropped();
                Err(Error::recording("metric queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.record_dropped();
                Err(Error::recording("metric sink writer has stopped"))
            }
        }
    }

    /// Wait until every record queued before this call has been handled
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if let Err(e) = self.sender.send(SinkCommand::Flush(ack)).await {
            warn!("Failed to send flush command: {}", e);
            return;
        }
        let _ = done.await;
    }

    /// The store records end up in
    pub fn store(&self) -> Arc<dyn MetricStore> {
        Arc::clone(&self.store)
    }

    /// Counters shared with the writer
    pub fn counters(&self) -> &TelemetryCounters {
        &self.counters
    }
}

impl Drop for MetricSink {
    fn drop(&mut self) {
        // Signal shutdown
        let _ = self.sender.try_send(SinkCommand::Shutdown);
    }
}

/// Background writer task
fn run_writer(
    store: Arc<dyn MetricStore>,
    config: SinkConfig,
    counters: TelemetryCounters,
    mut receiver: mpsc::Receiver<SinkCommand>,
) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        while let Some(cmd) = receiver.recv().await {
            match cmd {
                SinkCommand::Record(record) => {
                    append_with_retry(store.as_ref(), *record, &config, &counters).await;
                }
                SinkCommand::Flush(ack) => {
                    if let Err(e) = store.flush() {
                        error!("Failed to flush metric store: {}", e);
                    }
                    let _ = ack.send(());
                }
                SinkCommand::Shutdown => {
                    debug!("Metric sink writer shutting down");
                    let _ = store.flush();
                    break;
                }
            }
        }
    });

    Ok(())
}

async fn append_with_retry(
    store: &dyn MetricStore,
    record: MetricRecord,
    config: &SinkConfig,
    counters: &TelemetryCounters,
) {
    let mut attempt = 0u32;
    loop {
        match store.append(record.clone()) {
            Ok(()) => {
                counters.record_written();
                return;
            }
            Err(e) if e.is_transient() && attempt < config.max_write_retries => {
                let backoff = config.retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                debug!(
                    "Append of {} failed (attempt {}), retrying in {}ms: {}",
                    record.id(),
                    attempt + 1,
                    backoff,
                    e
                );
                counters.record_retry();
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => {
                counters.record_dropped();
                warn!(
                    class = %record.class(),
                    "Dropping metric record {} after {} attempts: {}",
                    record.id(),
                    attempt + 1,
                    e
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use vigil_core::{OperationClass, OperationMetric, TimeWindow};

    /// Fails the first `failures` appends, then delegates
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl MetricStore for FlakyStore {
        fn append(&self, record: MetricRecord) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::sink_write("disk busy"));
            }
            self.inner.append(record)
        }
        fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
            self.inner.scan(class, window)
        }
        fn scan_dimension(
            &self,
            class: OperationClass,
            dimension: &str,
            window: &TimeWindow,
        ) -> Result<Vec<MetricRecord>> {
            self.inner.scan_dimension(class, dimension, window)
        }
        fn scan_outcome(
            &self,
            class: OperationClass,
            success: bool,
            window: &TimeWindow,
        ) -> Result<Vec<MetricRecord>> {
            self.inner.scan_outcome(class, success, window)
        }
        fn purge_before(&self, class: OperationClass, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.purge_before(class, cutoff)
        }
        fn count(&self, class: OperationClass) -> Result<u64> {
            self.inner.count(class)
        }
        fn reset(&self) -> Result<()> {
            self.inner.reset()
        }
        fn generation(&self) -> u64 {
            self.inner.generation()
        }
    }

    fn fast_config() -> SinkConfig {
        SinkConfig {
            queue_capacity: 64,
            max_write_retries: 2,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_records_reach_store_after_flush() {
        let store = Arc::new(MemoryStore::new());
        let sink = MetricSink::new(store.clone(), fast_config(), TelemetryCounters::new()).unwrap();

        for _ in 0..5 {
            sink.record(OperationMetric::new("login", 3.0, true).into())
                .unwrap();
        }
        sink.flush().await;

        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 5);
        assert_eq!(sink.counters().snapshot().records_written, 5);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(2),
        });
        let sink = MetricSink::new(store.clone(), fast_config(), TelemetryCounters::new()).unwrap();

        sink.record(OperationMetric::new("login", 3.0, true).into())
            .unwrap();
        sink.flush().await;

        let snapshot = sink.counters().snapshot();
        assert_eq!(snapshot.write_retries, 2);
        assert_eq!(snapshot.dropped_metrics, 0);
        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_record() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(100),
        });
        let sink = MetricSink::new(store.clone(), fast_config(), TelemetryCounters::new()).unwrap();

        sink.record(OperationMetric::new("login", 3.0, true).into())
            .unwrap();
        sink.flush().await;

        let snapshot = sink.counters().snapshot();
        assert_eq!(snapshot.dropped_metrics, 1);
        assert_eq!(snapshot.write_retries, 2);
        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 0);
    }
}
