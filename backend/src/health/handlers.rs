use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use glimmr_shared::HealthCheckResult;

use crate::AppState;

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
}

/// Full report. Always 200; the verdict is in the body.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthCheckResult> {
    Json(state.health.check_health().await)
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.health.is_ready().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(json!({ "ready": ready, "timestamp": Utc::now() })))
}

pub async fn liveness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "alive": state.health.is_alive(),
            "uptime": state.health.uptime().as_secs_f64(),
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now(),
        })),
    )
}
