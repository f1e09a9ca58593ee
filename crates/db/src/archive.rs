//! [`JobArchive`] implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dispatch_core::archive::JobArchive;
use dispatch_core::error::CoreError;
use dispatch_core::jobs::Job;
use dispatch_core::types::JobId;
use tokio::sync::RwLock;

use crate::repositories::DispatchJobRepo;
use crate::DbPool;

fn db_err(err: sqlx::Error) -> CoreError {
    CoreError::Internal(format!("database: {err}"))
}

/// Writes terminal jobs to the `dispatch_jobs` table.
pub struct PgJobArchive {
    pool: DbPool,
}

impl PgJobArchive {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobArchive for PgJobArchive {
    async fn persist(&self, job: &Job) -> Result<(), CoreError> {
        DispatchJobRepo::upsert(&self.pool, job)
            .await
            .map_err(db_err)?;
        tracing::debug!(job_id = %job.id, status = %job.status, "Job archived");
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        crate::health_check(&self.pool).await.map_err(db_err)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Keeps archived jobs in memory. Used when no database is configured.
#[derive(Default)]
pub struct MemoryJobArchive {
    jobs: RwLock<HashMap<JobId, Job>>,
    offline: AtomicBool,
}

impl MemoryJobArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    fn check_online(&self) -> Result<(), CoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CoreError::Internal("database: archive offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobArchive for MemoryJobArchive {
    async fn persist(&self, job: &Job) -> Result<(), CoreError> {
        self.check_online()?;
        let mut jobs = self.jobs.write().await;
        let newer_stored = jobs
            .get(&job.id)
            .is_some_and(|stored| stored.updated_at > job.updated_at);
        if !newer_stored {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        self.check_online()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use dispatch_core::jobs::{JobKind, JobStatus, NewJob, Priority};

    use super::*;

    fn job() -> Job {
        Job::new(
            NewJob {
                kind: JobKind::Standard,
                area: "logan".into(),
                payload: serde_json::json!({}),
                reporter: None,
                not_before: None,
            },
            Priority::Standard,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn persist_is_idempotent_and_keeps_newest() {
        let archive = MemoryJobArchive::new();
        let mut job = job();
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        archive.persist(&job).await.unwrap();
        archive.persist(&job).await.unwrap();
        assert_eq!(archive.len().await, 1);

        let mut stale = job.clone();
        stale.status = JobStatus::Failed;
        stale.updated_at = job.updated_at - Duration::seconds(5);
        archive.persist(&stale).await.unwrap();
        assert_eq!(archive.get(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn offline_archive_fails_closed() {
        let archive = MemoryJobArchive::new();
        archive.set_offline(true);
        assert_matches!(archive.persist(&job()).await, Err(CoreError::Internal(_)));
        assert_matches!(archive.ping().await, Err(CoreError::Internal(_)));

        archive.set_offline(false);
        assert!(archive.ping().await.is_ok());
    }
}
