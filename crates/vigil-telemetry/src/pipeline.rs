//! Wiring of the telemetry components into one explicitly owned pipeline

use crate::aggregate::Aggregator;
use crate::compliance::ComplianceChecker;
use crate::config::{StorageBackend, TelemetryConfig};
use crate::counters::TelemetryCounters;
use crate::exporter::Exporter;
use crate::health::HealthScorer;
use crate::measure::SecurityMonitor;
use crate::persistence::JsonlStore;
use crate::retention::Retention;
use crate::sink::MetricSink;
use crate::store::{MemoryStore, MetricStore};
use crate::summary::SummaryTable;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_core::Result;

const SUMMARY_FILE: &str = "health_summary.json";

/// Every telemetry component sharing one store
pub struct TelemetryPipeline {
    config: TelemetryConfig,
    store: Arc<dyn MetricStore>,
    counters: TelemetryCounters,
    monitor: SecurityMonitor,
    aggregator: Aggregator,
    summaries: Arc<SummaryTable>,
    health: Arc<HealthScorer>,
    compliance: Arc<ComplianceChecker>,
    retention: Arc<Retention>,
    exporter: Exporter,
}

impl TelemetryPipeline {
    /// Build the pipeline on the configured storage backend
    pub fn build(config: TelemetryConfig) -> Result<Self> {
        config.validate()?;

        let (store, summaries): (Arc<dyn MetricStore>, SummaryTable) = match config.storage.backend {
            StorageBackend::Memory => (Arc::new(MemoryStore::new()), SummaryTable::in_memory()),
            StorageBackend::Jsonl => {
                let persistence = config.storage.persistence.clone();
                let summaries = SummaryTable::open(persistence.data_dir.join(SUMMARY_FILE))?;
                (Arc::new(JsonlStore::open(persistence)?), summaries)
            }
        };

        Self::assemble(config, store, summaries)
    }

    /// Build the pipeline around an existing store with in-memory summaries
    pub fn with_store(config: TelemetryConfig, store: Arc<dyn MetricStore>) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, store, SummaryTable::in_memory())
    }

    fn assemble(
        config: TelemetryConfig,
        store: Arc<dyn MetricStore>,
        summaries: SummaryTable,
    ) -> Result<Self> {
        if config.retention_shorter_than_rotation() {
            warn!(
                "Retention keeps {} days but rotations are due every {} days; \
                 older rotation history lives only in the compliance summary",
                config.retention.days_to_keep, config.compliance.rotation_interval_days
            );
        }

        let counters = TelemetryCounters::new();
        let summaries = Arc::new(summaries);
        let sink = Arc::new(MetricSink::new(
            Arc::clone(&store),
            config.sink.clone(),
            counters.clone(),
        )?);
        let monitor = SecurityMonitor::with_enabled(sink, config.monitoring.enabled);
        let aggregator = Aggregator::new(Arc::clone(&store));
        let health = Arc::new(HealthScorer::new(
            aggregator.clone(),
            config.health.clone(),
            Arc::clone(&summaries),
        ));
        let compliance = Arc::new(ComplianceChecker::new(
            Arc::clone(&store),
            config.compliance.clone(),
            Arc::clone(&summaries),
        ));
        let retention = Arc::new(Retention::new(
            Arc::clone(&store),
            counters.clone(),
            config.retention.clone(),
        ));
        let exporter = Exporter::new(counters.clone(), Arc::clone(&health), Arc::clone(&compliance));

        info!(
            backend = ?config.storage.backend,
            monitoring = config.monitoring.enabled,
            "Telemetry pipeline ready"
        );

        Ok(Self {
            config,
            store,
            counters,
            monitor,
            aggregator,
            summaries,
            health,
            compliance,
            retention,
            exporter,
        })
    }

    /// Start the health, compliance and retention timers
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = vec![
            Arc::clone(&self.health).spawn_refresh_loop(),
            Arc::clone(&self.compliance).spawn_refresh_loop(),
        ];
        if self.config.retention.enabled {
            handles.push(Arc::clone(&self.retention).spawn_schedule());
        }
        BackgroundTasks { handles }
    }

    /// Drain queued records into the store
    pub async fn flush(&self) {
        self.monitor.flush().await;
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetricStore> {
        &self.store
    }

    pub fn counters(&self) -> &TelemetryCounters {
        &self.counters
    }

    pub fn monitor(&self) -> &SecurityMonitor {
        &self.monitor
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn summaries(&self) -> &Arc<SummaryTable> {
        &self.summaries
    }

    pub fn health(&self) -> &Arc<HealthScorer> {
        &self.health
    }

    pub fn compliance(&self) -> &Arc<ComplianceChecker> {
        &self.compliance
    }

    pub fn retention(&self) -> &Arc<Retention> {
        &self.retention
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }
}

/// Handles of the background timers; aborted on drop
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort();
    }
}
