//! Handlers for the `/jobs` resource.
//!
//! Lets external systems submit standard and scheduled work, and operators
//! inspect or retry jobs. Guarded by [`AdminToken`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use dispatch_core::channels::{area_channel, normalize_scope, ChannelKind};
use dispatch_core::error::CoreError;
use dispatch_core::jobs::{JobKind, NewJob, Priority};
use dispatch_core::types::{JobId, Timestamp};
use serde::Deserialize;
use validator::Validate;

use crate::dispatch::offer_ready;
use crate::error::AppResult;
use crate::middleware::auth::AdminToken;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub kind: JobKind,
    /// Area the job is offered to; normalised into an `area:` channel scope.
    #[validate(length(min = 1, max = 100))]
    pub area: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    /// Scheduled start. Jobs with a future time start `delayed`.
    pub not_before: Option<Timestamp>,
    /// Overrides the tier implied by `kind`.
    pub priority: Option<Priority>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Enqueue a job and offer it right away if it is already eligible.
/// Returns 201 with the created job.
pub async fn submit_job(
    _admin: AdminToken,
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    input.validate().map_err(CoreError::from)?;
    ChannelKind::parse(&area_channel(&input.area))?;

    let priority = input
        .priority
        .unwrap_or_else(|| input.kind.default_priority());
    let job = state
        .queue
        .enqueue(
            NewJob {
                kind: input.kind,
                area: normalize_scope(&input.area),
                payload: input.payload,
                reporter: None,
                not_before: input.not_before,
            },
            priority,
        )
        .await?;

    let offered = offer_ready(&state.queue, &state.hub, priority).await;

    tracing::info!(
        job_id = %job.id,
        kind = job.kind.as_str(),
        priority = %priority,
        offered,
        "Job submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    _admin: AdminToken,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.queue.get_status(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/retry
///
/// Move a failed job back to `waiting` while it is under the retry limit,
/// then offer it again.
pub async fn retry_job(
    _admin: AdminToken,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.queue.retry(job_id).await?;
    offer_ready(&state.queue, &state.hub, job.priority).await;

    tracing::info!(job_id = %job.id, retry_count = job.retry_count, "Job retried by operator");

    Ok(Json(DataResponse { data: job }))
}
