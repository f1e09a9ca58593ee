//! Row type for the `dispatch_jobs` table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// An archived job as stored in Postgres. Enum columns are kept as their
/// wire strings.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DispatchJobRow {
    pub id: Uuid,
    pub kind: String,
    pub priority: String,
    pub area: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub reporter: Option<String>,
    pub assigned_contractor: Option<String>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}
