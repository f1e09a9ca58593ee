use std::collections::{HashMap, VecDeque};

use dispatch_core::jobs::{Job, JobStatus, Priority};
use dispatch_core::types::{JobId, Timestamp};
use tokio::time::Instant;

/// What this process knows about a job it is responsible for.
///
/// `status` is a cache of the store record; the record wins whenever the
/// two disagree.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub priority: Priority,
    pub status: JobStatus,
    pub not_before: Option<Timestamp>,
    /// Earliest instant the job may be offered again.
    pub visible_at: Instant,
    pub finished_at: Option<Timestamp>,
    pub archived: bool,
}

/// Local priority index: one FIFO of pending ids per tier plus a map of
/// every tracked job.
#[derive(Debug, Default)]
pub(crate) struct TierIndex {
    tiers: [VecDeque<JobId>; 3],
    entries: HashMap<JobId, IndexEntry>,
    dead_letters: VecDeque<JobId>,
}

impl TierIndex {
    /// Track a job. Pending jobs are appended to their tier.
    pub fn track(&mut self, job: &Job, now: Instant) {
        let finished_at = job.status.is_terminal().then_some(job.updated_at);
        let entry = IndexEntry {
            priority: job.priority,
            status: job.status,
            not_before: job.not_before,
            visible_at: now,
            finished_at,
            archived: job.archived,
        };
        self.entries.insert(job.id, entry);
        let tier = &mut self.tiers[job.priority.index()];
        tier.retain(|id| *id != job.id);
        if job.status.is_pending() {
            tier.push_back(job.id);
        }
    }

    /// Refresh the cached state from a freshly loaded record.
    pub fn sync(&mut self, job: &Job) {
        let Some(entry) = self.entries.get_mut(&job.id) else {
            return;
        };
        entry.status = job.status;
        entry.not_before = job.not_before;
        entry.archived = job.archived;
        entry.finished_at = job.status.is_terminal().then_some(job.updated_at);
        if !job.status.is_pending() {
            self.tiers[job.priority.index()].retain(|id| *id != job.id);
        }
    }

    pub fn forget(&mut self, id: JobId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.tiers[entry.priority.index()].retain(|queued| *queued != id);
        }
        self.dead_letters.retain(|queued| *queued != id);
    }

    /// Next visible, eligible job in `priority`'s tier. The job is hidden
    /// until `hide_until` so repeated calls move on to the next one.
    pub fn next_visible(
        &mut self,
        priority: Priority,
        now: Instant,
        wall_now: Timestamp,
        hide_until: Instant,
    ) -> Option<JobId> {
        let entries = &mut self.entries;
        let id = self.tiers[priority.index()].iter().copied().find(|id| {
            entries.get(id).is_some_and(|e| {
                e.status.is_pending()
                    && e.visible_at <= now
                    && e.not_before.is_none_or(|at| at <= wall_now)
            })
        })?;
        if let Some(entry) = entries.get_mut(&id) {
            entry.visible_at = hide_until;
        }
        Some(id)
    }

    pub fn pending_count(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Terminal jobs that finished before `cutoff`.
    pub fn finished_before(&self, cutoff: Timestamp) -> Vec<JobId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.finished_at.is_some_and(|at| at < cutoff))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn unarchived_terminal(&self) -> Vec<JobId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status.is_terminal() && !e.archived)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn entries_in(&self, priority: Priority) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values().filter(move |e| e.priority == priority)
    }

    pub fn push_dead_letter(&mut self, id: JobId) {
        if !self.dead_letters.contains(&id) {
            self.dead_letters.push_back(id);
        }
    }

    pub fn remove_dead_letter(&mut self, id: JobId) {
        self.dead_letters.retain(|queued| *queued != id);
    }

    pub fn dead_letters(&self) -> Vec<JobId> {
        self.dead_letters.iter().copied().collect()
    }
}
