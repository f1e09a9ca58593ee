use async_trait::async_trait;

use crate::error::CoreError;
use crate::jobs::Job;

/// External system of record for finished jobs.
///
/// The dispatch core writes a job here once it reaches a terminal status and
/// only marks the shared-store record archived after `persist` succeeds.
#[async_trait]
pub trait JobArchive: Send + Sync {
    /// Upsert the job's current state. Must be idempotent per job id.
    async fn persist(&self, job: &Job) -> Result<(), CoreError>;

    /// Cheap reachability probe used by readiness checks.
    async fn ping(&self) -> Result<(), CoreError>;

    /// Short backend name for health output.
    fn backend(&self) -> &'static str;
}
