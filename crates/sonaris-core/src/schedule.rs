//! Schedules and schedule entries.
//!
//! A recurring job runs on a fixed grid `start + k * every`. The next fire
//! time is always derived from the previous *scheduled* time, never from the
//! completion time, so execution latency does not accumulate as drift. When one
//! or more grid points were missed (a long run, or the engine was down), they
//! are coalesced into a single immediate run and the cadence resumes on the
//! original grid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::JobId;

/// When a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRule {
    /// Run a single time, at `at` or as soon as possible when absent.
    Once {
        /// Requested fire time.
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    /// Run repeatedly every `every`, starting at `start` (or on submission).
    Interval {
        /// First grid point.
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        /// Grid spacing.
        #[serde(with = "humantime_serde")]
        every: Duration,
    },
}

impl Default for ScheduleRule {
    fn default() -> Self {
        Self::Once { at: None }
    }
}

/// A (grid slot, fire time) pair produced by the schedule arithmetic.
///
/// `slot` is the nominal scheduled time used as the base for the next
/// computation; `fire_at` is when the job actually becomes due. They differ
/// only when a missed slot is being caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Nominal scheduled time.
    pub slot: DateTime<Utc>,
    /// Time the job becomes due.
    pub fire_at: DateTime<Utc>,
}

impl ScheduleRule {
    /// Run once, immediately.
    pub fn once() -> Self {
        Self::Once { at: None }
    }

    /// Run once at `at`.
    pub fn once_at(at: DateTime<Utc>) -> Self {
        Self::Once { at: Some(at) }
    }

    /// Run every `every`, starting on submission.
    pub fn every(every: Duration) -> Self {
        Self::Interval { start: None, every }
    }

    /// Run every `every`, with the grid anchored at `start`.
    pub fn every_from(start: DateTime<Utc>, every: Duration) -> Self {
        Self::Interval {
            start: Some(start),
            every,
        }
    }

    /// True for interval schedules.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Interval { .. })
    }

    /// Repeat interval, if any.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Interval { every, .. } => Some(*every),
            Self::Once { .. } => None,
        }
    }

    /// Placement of the first run for a job submitted at `now`.
    pub fn first_placement(&self, now: DateTime<Utc>) -> Placement {
        let slot = match self {
            Self::Once { at } => at.unwrap_or(now),
            Self::Interval { start, .. } => start.unwrap_or(now),
        };
        self.catch_up(slot, now)
    }

    /// Placement of the run after the one scheduled at `slot`, evaluated at
    /// `now`. Returns `None` for one-shot schedules.
    pub fn next_placement(&self, slot: DateTime<Utc>, now: DateTime<Utc>) -> Option<Placement> {
        let every = self.interval()?;
        let candidate = add(slot, every);
        if candidate >= now {
            return Some(Placement {
                slot: candidate,
                fire_at: candidate,
            });
        }
        Some(Placement {
            slot: latest_grid_point(slot, every, now),
            fire_at: now,
        })
    }

    /// Re-evaluate a stored slot at `now`.
    ///
    /// A future slot is left untouched. A past slot becomes due immediately;
    /// for interval schedules every missed grid point collapses into the most
    /// recent one so the job fires exactly once before resuming its cadence.
    pub fn catch_up(&self, slot: DateTime<Utc>, now: DateTime<Utc>) -> Placement {
        if slot >= now {
            return Placement {
                slot,
                fire_at: slot,
            };
        }
        match self {
            Self::Once { .. } => Placement { slot, fire_at: now },
            Self::Interval { every, .. } => Placement {
                slot: latest_grid_point(slot, *every, now),
                fire_at: now,
            },
        }
    }
}

/// Largest `origin + k * every` (k >= 0) that is not after `now`.
fn latest_grid_point(origin: DateTime<Utc>, every: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let step = every.as_millis().max(1) as i64;
    let elapsed = (now - origin).num_milliseconds().max(0);
    let k = elapsed / step;
    let offset = chrono::Duration::milliseconds(k.saturating_mul(step));
    origin.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn add(at: DateTime<Utc>, every: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(every)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whether an entry is a regular run or a re-queued attempt of the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A fresh run; the job's retry count is reset on dispatch.
    #[default]
    Regular,
    /// A re-queued attempt after the endpoint could not be acquired.
    Retry,
}

/// Binds a job to its next fire time. A job has at most one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Owning job.
    pub job_id: JobId,
    /// Submission sequence number of the job, used as the tie-breaker.
    pub seq: u64,
    /// Nominal grid slot of this run.
    pub slot: DateTime<Utc>,
    /// When the entry becomes due.
    pub fire_at: DateTime<Utc>,
    /// Regular run or retry.
    #[serde(default)]
    pub kind: EntryKind,
}

impl ScheduleEntry {
    /// Build a regular entry from a placement.
    pub fn regular(job_id: JobId, seq: u64, placement: Placement) -> Self {
        Self {
            job_id,
            seq,
            slot: placement.slot,
            fire_at: placement.fire_at,
            kind: EntryKind::Regular,
        }
    }

    /// Re-queue this run at `fire_at`, keeping its slot.
    pub fn retry_at(&self, fire_at: DateTime<Utc>) -> Self {
        Self {
            fire_at,
            kind: EntryKind::Retry,
            ..self.clone()
        }
    }

    /// Queue ordering key: earliest deadline first, then submission order.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.fire_at, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn next_run_is_computed_from_scheduled_time() {
        let rule = ScheduleRule::every_from(t(0), Duration::from_secs(10));
        // run scheduled at t0 finished at t3
        let next = rule.next_placement(t(0), t(3)).expect("recurring");
        assert_eq!(next.slot, t(10));
        assert_eq!(next.fire_at, t(10));
    }

    #[test]
    fn missed_slots_are_coalesced() {
        let rule = ScheduleRule::every_from(t(0), Duration::from_secs(10));
        // run scheduled at t0 finished at t35: t10, t20, t30 missed
        let next = rule.next_placement(t(0), t(35)).expect("recurring");
        assert_eq!(next.slot, t(30), "coalesced onto latest grid point");
        assert_eq!(next.fire_at, t(35), "fires immediately");

        let after = rule.next_placement(next.slot, t(36)).expect("recurring");
        assert_eq!(after.slot, t(40), "cadence resumes on original grid");
    }

    #[test]
    fn one_shot_has_no_next_run() {
        assert!(ScheduleRule::once().next_placement(t(0), t(1)).is_none());
    }

    #[test]
    fn first_placement_defaults_to_now() {
        let placement = ScheduleRule::every(Duration::from_secs(5)).first_placement(t(7));
        assert_eq!(placement.slot, t(7));
        assert_eq!(placement.fire_at, t(7));

        let future = ScheduleRule::once_at(t(100)).first_placement(t(7));
        assert_eq!(future.fire_at, t(100));
    }

    #[test]
    fn catch_up_keeps_future_slots() {
        let rule = ScheduleRule::every_from(t(0), Duration::from_secs(10));
        let p = rule.catch_up(t(50), t(20));
        assert_eq!((p.slot, p.fire_at), (t(50), t(50)));
    }

    #[test]
    fn entries_order_by_deadline_then_sequence() {
        let a = ScheduleEntry::regular(JobId::new(), 2, ScheduleRule::once().first_placement(t(0)));
        let b = ScheduleEntry::regular(JobId::new(), 1, ScheduleRule::once().first_placement(t(0)));
        let c = ScheduleEntry::regular(JobId::new(), 0, ScheduleRule::once().first_placement(t(1)));
        let mut entries = vec![c.clone(), a.clone(), b.clone()];
        entries.sort_by_key(ScheduleEntry::order_key);
        assert_eq!(entries, vec![b, a, c]);
    }

    #[test]
    fn interval_serializes_human_readable() {
        let rule = ScheduleRule::every(Duration::from_millis(1500));
        let json = serde_json::to_string(&rule).expect("serialize");
        assert!(json.contains("\"1s 500ms\""), "got {json}");
        let back: ScheduleRule = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, rule);
    }
}
