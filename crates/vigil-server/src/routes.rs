//! HTTP routes and handlers

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use vigil_core::TimeWindow;
use vigil_telemetry::{ComplianceReport, HealthReport, HealthStatus};

use crate::state::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn create_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.http.request_timeout_secs.max(1));

    Router::new()
        .route("/health", get(health))
        .route("/compliance", get(compliance))
        .route("/metrics", get(metrics))
        .route("/summary", get(summary))
        .route("/rollups", get(rollups))
        .route("/admin/cleanup", post(cleanup))
        .fallback(fallback)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RefreshParams {
    /// Recompute before answering instead of serving the cached report
    #[serde(default)]
    refresh: bool,
}

/// Health report; 503 only when the score is unhealthy
async fn health(
    State(state): State<AppState>,
    Query(params): Query<RefreshParams>,
) -> (StatusCode, Json<HealthReport>) {
    let scorer = state.pipeline.health();
    let report = if params.refresh {
        scorer.refresh().await
    } else {
        scorer.current()
    };

    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}

/// Compliance report; evaluation problems surface as `unknown`, never as errors
async fn compliance(
    State(state): State<AppState>,
    Query(params): Query<RefreshParams>,
) -> Json<ComplianceReport> {
    let checker = state.pipeline.compliance();
    let report = if params.refresh {
        checker.refresh().await
    } else {
        checker.current()
    };
    Json(report)
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.render_metrics(),
    )
        .into_response()
}

async fn summary(State(state): State<AppState>) -> Response {
    Json(state.pipeline.summaries().all()).into_response()
}

#[derive(Debug, Deserialize)]
struct RollupParams {
    hours: Option<i64>,
}

async fn rollups(
    State(state): State<AppState>,
    Query(params): Query<RollupParams>,
) -> Result<Response, AppError> {
    let hours = params.hours.unwrap_or(state.config.telemetry.health.window_hours);
    let max = state.config.http.max_rollup_hours;
    if hours <= 0 || hours > max {
        return Err(AppError::InvalidRequest(format!(
            "hours must be between 1 and {}",
            max
        )));
    }

    let aggregator = state.pipeline.aggregator().clone();
    let window = TimeWindow::last_hours(Utc::now(), hours);
    let rollups = tokio::task::spawn_blocking(move || aggregator.hourly_rollups(&window))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(Json(rollups).into_response())
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    days: Option<i64>,
}

async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Response, AppError> {
    let retention = state.pipeline.retention().clone();
    let days = params.days.unwrap_or(retention.config().days_to_keep);
    info!(days, "Manual retention cleanup requested");

    let report = tokio::task::spawn_blocking(move || retention.cleanup(days))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;

    Ok(Json(report).into_response())
}

async fn fallback() -> Response {
    AppError::NotFound.into_response()
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("telemetry temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Internal(String),
}

impl From<vigil_core::Error> for AppError {
    fn from(err: vigil_core::Error) -> Self {
        use vigil_core::Error;
        match err {
            Error::Config(msg) => AppError::InvalidRequest(msg),
            e @ (Error::AggregationQuery(_) | Error::ComplianceEvaluation(_) | Error::Timeout) => {
                AppError::Unavailable(e.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        });

        (status, Json(body)).into_response()
    }
}
