use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde_json::json;

use crate::health::{self, HealthReport};
use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

/// GET /health -- dependency checks; `degraded` rather than an error when
/// something is down.
async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(health::check(&state).await)
}

/// GET /health/ready -- 503 until every dependency check passes.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ready = health::check(&state).await.is_healthy();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready })))
}

/// GET /health/metrics -- counters and rolling-window stats.
async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot(&state.hub, &state.queue).await)
}

/// Mount health routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/health/metrics", get(metrics))
}
