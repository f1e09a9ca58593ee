//! Repository for the `dispatch_jobs` table.

use dispatch_core::jobs::Job;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::dispatch_job::DispatchJobRow;

const COLUMNS: &str = "\
    id, kind, priority, area, status, payload, reporter, assigned_contractor, \
    retry_count, failure_reason, not_before, created_at, updated_at, archived_at";

pub struct DispatchJobRepo;

impl DispatchJobRepo {
    /// Insert or overwrite the archived copy of a job.
    ///
    /// A later write for the same id wins only if it is at least as recent,
    /// so a delayed retry cannot roll a row back.
    pub async fn upsert(pool: &PgPool, job: &Job) -> Result<DispatchJobRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO dispatch_jobs \
                 (id, kind, priority, area, status, payload, reporter, assigned_contractor, \
                  retry_count, failure_reason, not_before, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 payload = EXCLUDED.payload, \
                 assigned_contractor = EXCLUDED.assigned_contractor, \
                 retry_count = EXCLUDED.retry_count, \
                 failure_reason = EXCLUDED.failure_reason, \
                 updated_at = EXCLUDED.updated_at, \
                 archived_at = NOW() \
             WHERE dispatch_jobs.updated_at <= EXCLUDED.updated_at \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, DispatchJobRow>(&query)
            .bind(job.id)
            .bind(job.kind.as_str())
            .bind(job.priority.as_str())
            .bind(&job.area)
            .bind(job.status.as_str())
            .bind(&job.payload)
            .bind(&job.reporter)
            .bind(&job.assigned_contractor)
            .bind(job.retry_count as i32)
            .bind(&job.failure_reason)
            .bind(job.not_before)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_optional(pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            // The stored row is newer; report it unchanged.
            None => Self::find_by_id(pool, job.id)
                .await?
                .ok_or(sqlx::Error::RowNotFound),
        }
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<DispatchJobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM dispatch_jobs WHERE id = $1");
        sqlx::query_as::<_, DispatchJobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
