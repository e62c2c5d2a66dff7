//! Shared application state

use crate::config::ServerConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use std::sync::Arc;
use vigil_telemetry::{Exporter, TelemetryPipeline};

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<ServerConfig>,

    /// Telemetry pipeline owned by this process
    pub pipeline: Arc<TelemetryPipeline>,

    /// Recorder the exporter publishes into and `/metrics` renders
    pub recorder: Arc<PrometheusRecorder>,
}

impl AppState {
    pub fn new(config: ServerConfig, pipeline: TelemetryPipeline) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            recorder: Arc::new(init_recorder()),
        }
    }

    /// Publish the current telemetry state and render it as Prometheus text
    pub fn render_metrics(&self) -> String {
        metrics::with_local_recorder(self.recorder.as_ref(), || {
            self.pipeline.exporter().publish();
        });
        self.recorder.handle().render()
    }
}

/// Build the Prometheus recorder and register metric descriptions with it
fn init_recorder() -> PrometheusRecorder {
    let recorder = PrometheusBuilder::new().build_recorder();
    metrics::with_local_recorder(&recorder, Exporter::describe);
    recorder
}
