//! Vigil Server
//!
//! HTTP surface of the Vigil telemetry pipeline: health and compliance
//! reports for liveness checks, Prometheus metrics for scraping, and maintenance
//! endpoints for operators.

pub mod config;
pub mod routes;
pub mod state;

pub use config::{Overrides, ServerConfig};
pub use routes::{create_router, AppError};
pub use state::AppState;
