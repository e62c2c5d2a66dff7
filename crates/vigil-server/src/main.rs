//! Vigil Server
//!
//! Runs the security telemetry pipeline and serves its health, compliance
//! and metrics endpoints.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use vigil_server::{create_router, AppState, Overrides, ServerConfig};
use vigil_telemetry::{MetricStore, TelemetryPipeline};

#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(about = "Security and performance telemetry server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_CONFIG", default_value = "vigil.yaml")]
    config: String,

    /// Listen address
    #[arg(short = 'l', long, env = "VIGIL_LISTEN")]
    listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long, env = "VIGIL_PORT")]
    port: Option<u16>,

    /// Persist metrics as JSON lines under this directory
    #[arg(short, long, env = "VIGIL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Days of metrics kept by the retention job
    #[arg(long, env = "VIGIL_RETENTION_DAYS")]
    retention_days: Option<i64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            port: self.port,
            data_dir: self.data_dir.clone(),
            retention_days: self.retention_days,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json_logs);

    info!("Starting Vigil server");

    let config = ServerConfig::load(&cli.config, &cli.overrides())?;
    info!("Configuration loaded successfully");
    info!("Storage backend: {:?}", config.telemetry.storage.backend);
    info!("Retention: {} days", config.telemetry.retention.days_to_keep);

    let pipeline = TelemetryPipeline::build(config.telemetry.clone())?;
    let background = pipeline.spawn_background();
    info!("Started {} background job(s)", background.len());

    let addr: SocketAddr = format!("{}:{}", config.http.listen, config.http.port).parse()?;
    let state = AppState::new(config, pipeline);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            warn!("Shutdown signal received, stopping server...");
        })
        .await?;

    background.abort();
    state.pipeline.flush().await;
    if let Err(e) = state.pipeline.store().flush() {
        error!("Failed to flush metric store: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("vigil=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
