pub mod admin;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                                 submit (POST)
/// /jobs/{id}                            status
/// /jobs/{id}/retry                      operator retry (POST)
///
/// /admin/dispatch/stats                 connection and queue counts
/// /admin/dispatch/dead-letters          jobs that exhausted their retries
/// ```
///
/// Every route requires the admin bearer token when one is configured.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/admin/dispatch", admin::router())
}
