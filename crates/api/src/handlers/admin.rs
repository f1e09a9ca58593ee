//! Operator views over the dispatch core.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use dispatch_events::RoleCounts;
use dispatch_queue::QueueDepth;
use serde::Serialize;

use crate::error::AppResult;
use crate::middleware::auth::AdminToken;
use crate::response::DataResponse;
use crate::state::AppState;

/// Counts shown on the admin dashboard.
#[derive(Debug, Serialize)]
pub struct DispatchStats {
    pub node_id: String,
    pub connections: RoleCounts,
    pub channels: usize,
    pub queue: QueueDepth,
    pub pending: usize,
    pub dead_letters: usize,
}

/// GET /api/v1/admin/dispatch/stats
pub async fn dispatch_stats(
    _admin: AdminToken,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let dead_letters = state.queue.dead_letters().await?.len();
    let stats = DispatchStats {
        node_id: state.config.node_id.clone(),
        connections: state.hub.registry().counts_by_role().await,
        channels: state.hub.channel_count().await,
        queue: state.queue.depth().await,
        pending: state.queue.pending_count().await,
        dead_letters,
    };
    Ok(Json(DataResponse { data: stats }))
}

/// GET /api/v1/admin/dispatch/dead-letters
///
/// Jobs that exhausted their retries, oldest first.
pub async fn dead_letters(
    _admin: AdminToken,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.queue.dead_letters().await?;
    Ok(Json(DataResponse { data: jobs }))
}
