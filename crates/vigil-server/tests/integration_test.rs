//! Integration tests for the Vigil HTTP surface

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::Value;
use tower::ServiceExt;
use vigil_core::{CryptoOperation, EncryptionMetric, KeyRotationMetric, OperationMetric};
use vigil_server::{create_router, AppState, ServerConfig};
use vigil_telemetry::{MetricStore, TelemetryConfig, TelemetryPipeline};

fn app() -> (Router, AppState) {
    let pipeline = TelemetryPipeline::build(TelemetryConfig::default()).unwrap();
    let state = AppState::new(ServerConfig::default(), pipeline);
    (create_router(state.clone()), state)
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, method, uri).await;
    (status, serde_json::from_str(&body).unwrap())
}

/// Value of an unlabelled sample in Prometheus text output
fn sample(rendered: &str, name: &str) -> Option<f64> {
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
        .and_then(|value| value.trim().parse().ok())
}

#[tokio::test]
async fn test_health_is_unknown_before_first_computation() {
    let (app, _) = app();
    let (status, body) = send_json(&app, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unknown");
    assert_eq!(body["stale"], true);
    assert!(body["last_updated"].is_null());
}

#[tokio::test]
async fn test_health_refresh_on_empty_store() {
    let (app, _) = app();
    let (status, body) = send_json(&app, "GET", "/health?refresh=true").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["score"], 100.0);
    assert_eq!(body["stale"], false);
    assert_eq!(body["per_class_breakdown"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unhealthy_score_returns_503() {
    let (app, state) = app();
    let sink = state.pipeline.monitor().sink();
    for _ in 0..5 {
        sink.record(OperationMetric::new("login", 900.0, false).into())
            .unwrap();
    }
    state.pipeline.flush().await;

    let (status, body) = send_json(&app, "GET", "/health?refresh=true").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_compliance_unknown_without_history() {
    let (app, _) = app();
    let (status, body) = send_json(&app, "GET", "/compliance?refresh=true").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unknown");
    assert!(body["last_check"].is_string());
    assert_eq!(body["details"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_metrics_endpoint_renders_prometheus_text() {
    let (app, state) = app();
    state.pipeline.compliance().check_at(Utc::now());

    let (status, body) = send(&app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("# TYPE vigil_compliance_status gauge"));
    assert_eq!(sample(&body, "vigil_compliance_status"), Some(-1.0));
    assert_eq!(sample(&body, "vigil_dropped_metrics_total"), Some(0.0));
}

#[tokio::test]
async fn test_summary_rows_after_refresh() {
    let (app, _) = app();
    send(&app, "GET", "/health?refresh=true").await;
    send(&app, "GET", "/compliance?refresh=true").await;

    let (status, body) = send_json(&app, "GET", "/summary").await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["metric_type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"system_health_score"));
    assert!(kinds.contains(&"pci_compliance_status"));
}

#[tokio::test]
async fn test_rollups_endpoint() {
    let (app, state) = app();
    let sink = state.pipeline.monitor().sink();
    for ms in [12.0, 15.0] {
        sink.record(EncryptionMetric::new("AES-256-GCM", 256, CryptoOperation::Encrypt, 64, ms, true).into())
            .unwrap();
    }
    state.pipeline.flush().await;

    let (status, body) = send_json(&app, "GET", "/rollups?hours=2").await;
    assert_eq!(status, StatusCode::OK);
    let rollups = body.as_array().unwrap();
    let total: u64 = rollups.iter().map(|r| r["count"].as_u64().unwrap()).sum();
    assert_eq!(total, 2);

    let (status, _) = send_json(&app, "GET", "/rollups?hours=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_cleanup() {
    let (app, state) = app();
    let store = state.pipeline.store();
    store
        .append(
            KeyRotationMetric::new("master_key", "m1", "m2", 2000.0, true)
                .at(Utc::now() - Duration::days(40))
                .into(),
        )
        .unwrap();

    let (status, body) = send_json(&app, "POST", "/admin/cleanup?days=30").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows_deleted"]["key_rotation_metrics"], 1);
    assert_eq!(body["total"], 1);

    let (status, _) = send_json(&app, "POST", "/admin/cleanup?days=-1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _) = app();
    let (status, body) = send_json(&app, "GET", "/v1/anything").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["status"], 404);
}
