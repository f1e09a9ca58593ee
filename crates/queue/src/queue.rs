use std::sync::Arc;

use chrono::Utc;
use dispatch_core::error::CoreError;
use dispatch_core::jobs::{Job, JobStatus, NewJob, Priority};
use dispatch_core::types::JobId;
use dispatch_store::{LockToken, StateStore};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::index::TierIndex;

fn record_key(id: JobId) -> String {
    format!("job:{id}")
}

fn heartbeat_key(id: JobId) -> String {
    format!("job:{id}:heartbeat")
}

fn lock_key(id: JobId) -> String {
    format!("lock:job:{id}")
}

/// Job counts by status for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Counts for every tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub emergency: StatusCounts,
    pub standard: StatusCounts,
    pub scheduled: StatusCounts,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Held per-job lock.
struct JobLock {
    key: String,
    token: LockToken,
}

pub struct JobQueue {
    store: Arc<dyn StateStore>,
    config: QueueConfig,
    index: Mutex<TierIndex>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StateStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            index: Mutex::new(TierIndex::default()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Create a job on `priority`'s tier.
    ///
    /// Jobs with a future `not_before` start `delayed`. Fails with `Conflict`
    /// when the pending backlog is at `max_pending`.
    pub async fn enqueue(&self, input: NewJob, priority: Priority) -> Result<Job, CoreError> {
        if self.is_saturated().await {
            return Err(CoreError::Conflict(format!(
                "Job queue is saturated ({} pending)",
                self.config.max_pending
            )));
        }
        let job = Job::new(input, priority, Utc::now());
        self.save(&job).await?;
        self.index.lock().await.track(&job, Instant::now());
        tracing::info!(
            job_id = %job.id,
            priority = %priority,
            status = %job.status,
            area = %job.area,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Next job to offer on `priority`'s tier, or `None`.
    ///
    /// The returned job is hidden for `offer_interval`; if nobody claims it by
    /// then it becomes visible again. Delayed jobs whose time has come are
    /// promoted to `waiting` on the way out.
    pub async fn dequeue(&self, priority: Priority) -> Result<Option<Job>, CoreError> {
        let attempts = self.index.lock().await.pending_count();
        for _ in 0..attempts {
            let now = Instant::now();
            let candidate = self.index.lock().await.next_visible(
                priority,
                now,
                Utc::now(),
                now + self.config.offer_interval,
            );
            let Some(id) = candidate else {
                return Ok(None);
            };

            let Some(mut job) = self.load(id).await? else {
                self.index.lock().await.forget(id);
                continue;
            };
            if job.status == JobStatus::Delayed && job.is_eligible(Utc::now()) {
                job = match self.update(id, |job, now| job.transition(JobStatus::Waiting, now)).await {
                    Ok(job) => job,
                    // Someone else is working on it; try again next round.
                    Err(CoreError::LockContention(_)) => continue,
                    Err(e) => return Err(e),
                };
                tracing::debug!(job_id = %id, "Delayed job promoted");
            }
            if job.status == JobStatus::Waiting {
                return Ok(Some(job));
            }
            self.index.lock().await.sync(&job);
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Assign a waiting job to `contractor` (`waiting -> active`).
    ///
    /// Exactly one concurrent caller wins; the others get `LockContention`
    /// or `Conflict`.
    pub async fn claim(&self, id: JobId, contractor: &str) -> Result<Job, CoreError> {
        let job = self.update(id, |job, now| job.assign(contractor, now)).await?;
        self.store
            .set(&heartbeat_key(id), "1", Some(self.config.heartbeat_timeout))
            .await?;
        let mut index = self.index.lock().await;
        index.track(&job, Instant::now());
        tracing::info!(job_id = %id, contractor, "Job claimed");
        Ok(job)
    }

    /// Refresh an active job's heartbeat. Returns `false` if the job is not
    /// active.
    pub async fn heartbeat(&self, id: JobId) -> Result<bool, CoreError> {
        match self.load(id).await? {
            Some(job) if job.status == JobStatus::Active => {
                self.store
                    .set(&heartbeat_key(id), "1", Some(self.config.heartbeat_timeout))
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `active -> completed`. When `by` is given it must be the assigned
    /// contractor.
    pub async fn mark_completed(&self, id: JobId, by: Option<&str>) -> Result<Job, CoreError> {
        let job = self
            .update(id, |job, now| {
                if let Some(by) = by {
                    if job.assigned_contractor.as_deref() != Some(by) {
                        return Err(CoreError::Forbidden(format!(
                            "Job {} is not assigned to {by}",
                            job.id
                        )));
                    }
                }
                job.transition(JobStatus::Completed, now)
            })
            .await?;
        self.clear_heartbeat(id).await;
        self.index.lock().await.sync(&job);
        tracing::info!(job_id = %id, "Job completed");
        Ok(job)
    }

    /// Move a job to `failed` and onto the dead-letter list.
    pub async fn mark_failed(&self, id: JobId, reason: &str) -> Result<Job, CoreError> {
        let job = self.update(id, |job, now| job.fail(reason, now)).await?;
        self.clear_heartbeat(id).await;
        let mut index = self.index.lock().await;
        index.sync(&job);
        index.push_dead_letter(id);
        tracing::warn!(job_id = %id, reason, "Job failed");
        Ok(job)
    }

    /// Operator retry: `failed -> waiting` while under the retry limit.
    pub async fn retry(&self, id: JobId) -> Result<Job, CoreError> {
        let max_retries = self.config.max_retries;
        let job = self
            .update(id, |job, now| {
                if job.status != JobStatus::Failed {
                    return Err(CoreError::Conflict(format!(
                        "Job {} is {} and cannot be retried",
                        job.id, job.status
                    )));
                }
                job.requeue(max_retries, now)
            })
            .await?;
        let mut index = self.index.lock().await;
        index.remove_dead_letter(id);
        index.track(&job, Instant::now());
        tracing::info!(job_id = %id, retry_count = job.retry_count, "Job retried");
        Ok(job)
    }

    /// Record that the job's terminal state reached the archive.
    pub async fn mark_archived(&self, id: JobId) -> Result<Job, CoreError> {
        let job = self
            .update(id, |job, _| {
                job.archived = true;
                Ok(())
            })
            .await?;
        self.index.lock().await.sync(&job);
        Ok(job)
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job, CoreError> {
        self.load(id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(id))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Requeue active jobs whose heartbeat expired, or fail them once the
    /// retry limit is reached. Contended jobs are left for the next pass.
    pub async fn reap_stale(&self) -> Result<ReapReport, CoreError> {
        let active = self.index.lock().await.ids_with_status(JobStatus::Active);
        let mut report = ReapReport::default();

        for id in active {
            if self.store.exists(&heartbeat_key(id)).await? {
                continue;
            }
            let lock = match self.lock(id).await {
                Ok(lock) => lock,
                Err(CoreError::LockContention(_)) => continue,
                Err(e) => return Err(e),
            };
            let result = self.reap_locked(id).await;
            self.unlock(lock).await;

            match result? {
                Some(job) if job.status == JobStatus::Waiting => {
                    tracing::warn!(job_id = %id, retry_count = job.retry_count, "Stale job requeued");
                    self.index.lock().await.track(&job, Instant::now());
                    report.requeued.push(id);
                }
                Some(job) => {
                    tracing::error!(job_id = %id, "Stale job failed after retry limit");
                    let mut index = self.index.lock().await;
                    index.sync(&job);
                    index.push_dead_letter(id);
                    report.failed.push(id);
                }
                None => {}
            }
        }
        Ok(report)
    }

    async fn reap_locked(&self, id: JobId) -> Result<Option<Job>, CoreError> {
        let Some(mut job) = self.load(id).await? else {
            self.index.lock().await.forget(id);
            return Ok(None);
        };
        if job.status != JobStatus::Active {
            self.index.lock().await.sync(&job);
            return Ok(None);
        }
        // A heartbeat may have landed between the check and the lock.
        if self.store.exists(&heartbeat_key(id)).await? {
            return Ok(None);
        }
        let now = Utc::now();
        if job.retry_count < self.config.max_retries {
            job.requeue(self.config.max_retries, now)?;
        } else {
            job.fail(
                format!("Heartbeat lost after {} retries", job.retry_count),
                now,
            )?;
        }
        self.save(&job).await?;
        Ok(Some(job))
    }

    /// Drop archived terminal jobs that finished more than `grace` ago.
    /// Unarchived jobs are kept until the archiver catches up.
    pub async fn clean(&self, grace: std::time::Duration) -> Result<usize, CoreError> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| CoreError::Validation(format!("Invalid grace period: {e}")))?;
        let candidates = self.index.lock().await.finished_before(Utc::now() - grace);

        let mut removed = 0;
        for id in candidates {
            match self.load(id).await? {
                Some(job) if !job.archived => continue,
                Some(_) => {
                    self.store.delete(&record_key(id)).await?;
                }
                None => {}
            }
            self.index.lock().await.forget(id);
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned finished jobs");
        }
        Ok(removed)
    }

    /// Terminal jobs not yet written to the archive.
    pub async fn unarchived_terminal(&self) -> Result<Vec<Job>, CoreError> {
        let ids = self.index.lock().await.unarchived_terminal();
        self.load_many(ids).await
    }

    /// The operator queue: jobs that failed for good.
    pub async fn dead_letters(&self) -> Result<Vec<Job>, CoreError> {
        let ids = self.index.lock().await.dead_letters();
        self.load_many(ids).await
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn get_queue_depth(&self, priority: Priority) -> StatusCounts {
        let index = self.index.lock().await;
        let mut counts = StatusCounts::default();
        for entry in index.entries_in(priority) {
            counts.add(entry.status);
        }
        counts
    }

    pub async fn depth(&self) -> QueueDepth {
        QueueDepth {
            emergency: self.get_queue_depth(Priority::Emergency).await,
            standard: self.get_queue_depth(Priority::Standard).await,
            scheduled: self.get_queue_depth(Priority::Scheduled).await,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.index.lock().await.pending_count()
    }

    pub async fn is_saturated(&self) -> bool {
        self.pending_count().await >= self.config.max_pending
    }

    /// Store reachable and backlog below `max_pending`.
    pub async fn is_healthy(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => !self.is_saturated().await,
            Err(e) => {
                tracing::warn!(error = %e, "Queue store ping failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Store plumbing
    // -----------------------------------------------------------------------

    async fn load(&self, id: JobId) -> Result<Option<Job>, CoreError> {
        match self.store.get(&record_key(id)).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn load_many(&self, ids: Vec<JobId>) -> Result<Vec<Job>, CoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn save(&self, job: &Job) -> Result<(), CoreError> {
        let text = serde_json::to_string(job)?;
        self.store
            .set(&record_key(job.id), &text, Some(self.config.record_ttl))
            .await?;
        Ok(())
    }

    async fn lock(&self, id: JobId) -> Result<JobLock, CoreError> {
        let key = lock_key(id);
        match self.store.acquire_lock(&key, self.config.lock_ttl).await? {
            Some(token) => Ok(JobLock { key, token }),
            None => Err(CoreError::LockContention(key)),
        }
    }

    async fn unlock(&self, lock: JobLock) {
        match self.store.release_lock(&lock.key, &lock.token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %lock.key, "Job lock expired before release"),
            Err(e) => tracing::warn!(key = %lock.key, error = %e, "Job lock release failed"),
        }
    }

    /// Load, mutate and save a job under its lock. Nothing is written when
    /// `mutate` fails.
    async fn update<F>(&self, id: JobId, mutate: F) -> Result<Job, CoreError>
    where
        F: FnOnce(&mut Job, chrono::DateTime<Utc>) -> Result<(), CoreError>,
    {
        let lock = self.lock(id).await?;
        let result = self.update_locked(id, mutate).await;
        self.unlock(lock).await;
        result
    }

    async fn update_locked<F>(&self, id: JobId, mutate: F) -> Result<Job, CoreError>
    where
        F: FnOnce(&mut Job, chrono::DateTime<Utc>) -> Result<(), CoreError>,
    {
        let mut job = self
            .load(id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(id))?;
        mutate(&mut job, Utc::now())?;
        self.save(&job).await?;
        Ok(job)
    }

    async fn clear_heartbeat(&self, id: JobId) {
        if let Err(e) = self.store.delete(&heartbeat_key(id)).await {
            tracing::debug!(job_id = %id, error = %e, "Heartbeat key not cleared");
        }
    }
}
