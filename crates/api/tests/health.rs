mod common;

use axum::http::StatusCode;
use common::{body_json, build_state_with_store_down, build_test_app, get, test_config};

use dispatch_api::router::build_app_router;

// ---------------------------------------------------------------------------
// Test: all dependencies up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_healthy() {
    let (app, _) = build_test_app();

    let response = get(app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["checks"]["database"], true);
    assert_eq!(json["checks"]["store"], true);
    assert_eq!(json["checks"]["queue"], true);
    assert_eq!(json["failed"].as_array().unwrap().len(), 0);
    assert!(json["version"].is_string());
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn ready_when_everything_is_up() {
    let (app, _) = build_test_app();

    let response = get(app, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

// ---------------------------------------------------------------------------
// Test: store outage degrades but still answers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_outage_reports_degraded() {
    let config = test_config();
    let state = build_state_with_store_down(config.clone());
    let app = build_app_router(state, &config);

    let response = get(app.clone(), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["checks"]["store"], false);
    assert_eq!(json["checks"]["database"], true);
    assert!(json["failed"]
        .as_array()
        .unwrap()
        .iter()
        .any(|name| name == "store"));

    let response = get(app, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["ready"], false);
}

#[tokio::test]
async fn archive_outage_reports_degraded() {
    let config = test_config();
    let (state, archive) = common::build_test_state(config.clone());
    archive.set_offline(true);
    let app = build_app_router(state, &config);

    let json = body_json(get(app, "/health").await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["checks"]["database"], false);
    assert_eq!(json["checks"]["store"], true);
}

// ---------------------------------------------------------------------------
// Test: metrics endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_snapshot_is_served() {
    let (app, _) = build_test_app();

    let response = get(app, "/health/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["messages_total"], 0);
    assert_eq!(json["connections"]["total"], 0);
    assert_eq!(json["queue"]["emergency"]["waiting"], 0);
    assert!(json["uptime_secs"].is_u64());
}

// ---------------------------------------------------------------------------
// Test: middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn responses_carry_a_request_id() {
    let (app, _) = build_test_app();

    let response = get(app, "/health").await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (app, _) = build_test_app();

    let response = get(app, "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
