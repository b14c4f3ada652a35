//! Earliest-deadline-first queue of schedule entries.

use chrono::{DateTime, Utc};
use sonaris_core::{JobId, ScheduleEntry};
use std::collections::{BTreeMap, HashMap};

/// Entries ordered by `(fire_at, seq)`, at most one per job.
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    order: BTreeMap<(DateTime<Utc>, u64), JobId>,
    entries: HashMap<JobId, ScheduleEntry>,
}

impl ScheduleQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, replacing any entry the job already had.
    pub fn insert(&mut self, entry: ScheduleEntry) -> Option<ScheduleEntry> {
        let previous = self.remove(&entry.job_id);
        self.order.insert(entry.order_key(), entry.job_id);
        self.entries.insert(entry.job_id, entry);
        previous
    }

    /// Remove the job's entry.
    pub fn remove(&mut self, job_id: &JobId) -> Option<ScheduleEntry> {
        let entry = self.entries.remove(job_id)?;
        self.order.remove(&entry.order_key());
        Some(entry)
    }

    /// The job's entry, if queued.
    pub fn get(&self, job_id: &JobId) -> Option<&ScheduleEntry> {
        self.entries.get(job_id)
    }

    /// Earliest entry whose fire time is at or before `now`.
    pub fn peek_due(&self, now: DateTime<Utc>) -> Option<&ScheduleEntry> {
        let (&(fire_at, _), job_id) = self.order.iter().next()?;
        if fire_at > now {
            return None;
        }
        self.entries.get(job_id)
    }

    /// Remove and return the earliest due entry.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<ScheduleEntry> {
        let job_id = self.peek_due(now)?.job_id;
        self.remove(&job_id)
    }

    /// Fire time of the earliest entry, due or not.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.order.keys().next().map(|(fire_at, _)| *fire_at)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
