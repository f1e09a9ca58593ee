//! Job model, priority tiers and the status state machine.
//!
//! This module lives in `core` (no I/O) so the queue, the router and the
//! archive all agree on what a legal transition is.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{ConnectionId, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Priority tiers
// ---------------------------------------------------------------------------

/// Queue tier. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency,
    Standard,
    Scheduled,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 3] = [Priority::Emergency, Priority::Standard, Priority::Scheduled];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Standard => "standard",
            Priority::Scheduled => "scheduled",
        }
    }

    /// Position in [`Priority::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of request the job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Emergency,
    Standard,
    Scheduled,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Emergency => "emergency",
            JobKind::Standard => "standard",
            JobKind::Scheduled => "scheduled",
        }
    }

    /// Tier a job of this kind is enqueued on unless told otherwise.
    pub fn default_priority(self) -> Priority {
        match self {
            JobKind::Emergency => Priority::Emergency,
            JobKind::Standard => Priority::Standard,
            JobKind::Scheduled => Priority::Scheduled,
        }
    }
}

// ---------------------------------------------------------------------------
// Status + state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Waiting or delayed: still looking for a contractor.
    pub fn is_pending(self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod state_machine {
    use super::JobStatus::{self, *};

    /// Statuses reachable from `from`.
    ///
    /// `Active -> Waiting` is the reaper's requeue and `Failed -> Waiting` the
    /// operator retry; both are additionally bounded by the retry limit.
    /// `Completed` is terminal.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        match from {
            Delayed => &[Waiting, Failed],
            Waiting => &[Active, Failed],
            Active => &[Completed, Failed, Waiting],
            Failed => &[Waiting],
            Completed => &[],
        }
    }

    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Input for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    /// Geographic area the job is offered to (`area:<area>` channel scope).
    pub area: String,
    /// Request details: emergency/service type, location, description,
    /// reporter contact.
    pub payload: serde_json::Value,
    /// Reporter connection, when the job came in over a socket.
    pub reporter: Option<ConnectionId>,
    /// Earliest time the job may be offered (scheduled jobs).
    pub not_before: Option<Timestamp>,
}

/// A unit of dispatched work as stored in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub area: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub reporter: Option<ConnectionId>,
    /// Contractor identity (registration contractor id, or connection id).
    pub assigned_contractor: Option<String>,
    pub not_before: Option<Timestamp>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    /// Set once the terminal state has been written to the external database.
    #[serde(default)]
    pub archived: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Build a fresh job record. Scheduled jobs whose `not_before` is still in
    /// the future start `delayed`; everything else starts `waiting`.
    pub fn new(input: NewJob, priority: Priority, now: Timestamp) -> Self {
        let status = match input.not_before {
            Some(at) if at > now => JobStatus::Delayed,
            _ => JobStatus::Waiting,
        };
        Self {
            id: uuid::Uuid::new_v4(),
            kind: input.kind,
            priority,
            area: input.area,
            payload: input.payload,
            status,
            reporter: input.reporter,
            assigned_contractor: None,
            not_before: input.not_before,
            retry_count: 0,
            failure_reason: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, enforcing the state machine.
    pub fn transition(&mut self, to: JobStatus, now: Timestamp) -> Result<(), CoreError> {
        state_machine::validate_transition(self.status, to).map_err(CoreError::Conflict)?;
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// `waiting -> active`, recording the contractor.
    pub fn assign(&mut self, contractor: &str, now: Timestamp) -> Result<(), CoreError> {
        if self.status != JobStatus::Waiting {
            return Err(CoreError::Conflict(format!(
                "Job {} is {} and cannot be accepted",
                self.id, self.status
            )));
        }
        if self.assigned_contractor.is_some() {
            return Err(CoreError::Conflict(format!(
                "Job {} already has a contractor",
                self.id
            )));
        }
        self.transition(JobStatus::Active, now)?;
        self.assigned_contractor = Some(contractor.to_string());
        Ok(())
    }

    /// Put the job back on the queue after a failure, bounded by `max_retries`.
    ///
    /// Clears the assignment so another contractor can take it.
    pub fn requeue(&mut self, max_retries: u32, now: Timestamp) -> Result<(), CoreError> {
        if self.retry_count >= max_retries {
            return Err(CoreError::Conflict(format!(
                "Job {} reached the retry limit ({max_retries})",
                self.id
            )));
        }
        self.transition(JobStatus::Waiting, now)?;
        self.retry_count += 1;
        self.assigned_contractor = None;
        self.failure_reason = None;
        Ok(())
    }

    /// Move to `failed` with a reason.
    pub fn fail(&mut self, reason: impl Into<String>, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Whether the job may be offered at `now`.
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.status.is_pending() && self.not_before.is_none_or(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};

    use super::state_machine::*;
    use super::*;

    fn new_job(not_before: Option<Timestamp>) -> Job {
        Job::new(
            NewJob {
                kind: JobKind::Emergency,
                area: "brisbane-cbd".into(),
                payload: serde_json::json!({"emergency_type": "flooding"}),
                reporter: Some("conn-r".into()),
                not_before,
            },
            Priority::Emergency,
            Utc::now(),
        )
    }

    #[test]
    fn tiers_order_emergency_first() {
        assert!(Priority::Emergency < Priority::Standard);
        assert!(Priority::Standard < Priority::Scheduled);
    }

    #[test]
    fn completed_is_terminal() {
        assert!(valid_transitions(JobStatus::Completed).is_empty());
    }

    #[test]
    fn failed_only_goes_back_to_waiting() {
        assert_eq!(valid_transitions(JobStatus::Failed), &[JobStatus::Waiting]);
    }

    #[test]
    fn waiting_cannot_complete_directly() {
        assert!(!can_transition(JobStatus::Waiting, JobStatus::Completed));
    }

    #[test]
    fn future_not_before_starts_delayed() {
        let job = new_job(Some(Utc::now() + Duration::minutes(10)));
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_eligible(Utc::now()));
    }

    #[test]
    fn assign_sets_contractor_once() {
        let mut job = new_job(None);
        job.assign("contractor-1", Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.assigned_contractor.as_deref(), Some("contractor-1"));

        assert_matches!(
            job.assign("contractor-2", Utc::now()),
            Err(CoreError::Conflict(_))
        );
        assert_eq!(job.assigned_contractor.as_deref(), Some("contractor-1"));
    }

    #[test]
    fn requeue_is_bounded_by_retry_limit() {
        let mut job = new_job(None);
        for attempt in 1..=2 {
            job.assign("c", Utc::now()).unwrap();
            job.requeue(2, Utc::now()).unwrap();
            assert_eq!(job.retry_count, attempt);
            assert!(job.assigned_contractor.is_none());
        }
        job.assign("c", Utc::now()).unwrap();
        assert_matches!(job.requeue(2, Utc::now()), Err(CoreError::Conflict(_)));
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.status, JobStatus::Active);
    }

    #[test]
    fn fail_records_reason() {
        let mut job = new_job(None);
        job.fail("no contractors", Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("no contractors"));
    }
}
