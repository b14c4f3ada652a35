//! Task queue and scheduler.
//!
//! The [`Scheduler`] owns the earliest-deadline-first [`ScheduleQueue`] and the
//! job state machine. Every state change is written through
//! [`StateStore::commit`] together with the job's schedule entry, so a restart
//! can rebuild the queue with [`Scheduler::rehydrate`].
//!
//! Recurring jobs are re-armed from their scheduled slot, never from the
//! completion time. When the next slot is already in the past the job fires
//! once immediately and the cadence resumes on the original grid.

mod queue;

pub use queue::ScheduleQueue;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sonaris_core::{
    DefinitionError, EntryKind, ErrorKind, Job, JobDefinition, JobError, JobId, JobState,
    Placement, RunRecord, ScheduleEntry, TransitionError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SonarisConfig;
use crate::error_recovery::RetryPolicy;
use crate::executor::{cancel_pair, CancelHandle, CancelToken, ExecutionReport, Outcome};
use crate::store::{StateStore, StoreError};

/// Scheduler failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Job {0} is running")]
    Running(JobId),
}

impl SchedulerError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::Definition(_) | SchedulerError::Transition(_) => {
                ErrorKind::ValidationFailure
            }
            SchedulerError::Store(_) => ErrorKind::Io,
            SchedulerError::Running(_) => ErrorKind::Busy,
        }
    }
}

/// Values applied to definitions that leave them unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    /// Retry budget.
    pub max_retries: u32,
    /// Per-attempt execution timeout.
    pub execution_timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            execution_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SonarisConfig> for JobDefaults {
    fn from(config: &SonarisConfig) -> Self {
        Self {
            max_retries: config.retry.max_retries,
            execution_timeout: config.execution.job_timeout,
        }
    }
}

/// Selects jobs for [`Scheduler::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Only jobs in this state.
    pub state: Option<JobState>,
    /// Only jobs targeting this endpoint.
    pub endpoint_id: Option<String>,
    /// Only jobs whose name contains this text (case-insensitive).
    pub name: Option<String>,
}

impl JobFilter {
    /// Matches every job.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to `state`.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Restrict to `endpoint_id`.
    pub fn with_endpoint(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = Some(endpoint_id.into());
        self
    }

    /// Restrict to names containing `name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |state| job.state == state)
            && self
                .endpoint_id
                .as_deref()
                .map_or(true, |endpoint| job.endpoint_id() == endpoint)
            && self.name.as_deref().map_or(true, |name| {
                job.name().to_lowercase().contains(&name.to_lowercase())
            })
    }
}

/// A job handed to a worker by [`Scheduler::take_due`].
#[derive(Debug)]
pub struct Dispatch {
    /// The job, already in `Running`.
    pub job: Job,
    /// Signalled when the job is cancelled while running.
    pub cancel: CancelToken,
}

/// Counts from [`Scheduler::rehydrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehydrateSummary {
    /// Non-terminal jobs put back in the queue.
    pub requeued: usize,
    /// Of those, jobs that were overdue or interrupted and fire immediately.
    pub overdue: usize,
    /// Terminal jobs left as they are.
    pub finished: usize,
}

#[derive(Debug)]
struct RunningJob {
    entry: ScheduleEntry,
    cancel: CancelHandle,
    cancel_requested: bool,
}

#[derive(Debug, Default)]
struct Inner {
    queue: ScheduleQueue,
    next_seq: u64,
    running: HashMap<JobId, RunningJob>,
}

/// The task queue and job state machine.
#[derive(Debug)]
pub struct Scheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    defaults: JobDefaults,
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// New scheduler over `store`. Call [`rehydrate`](Self::rehydrate) to load
    /// persisted jobs.
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        defaults: JobDefaults,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            defaults,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The clock driving fire times.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Validate and enqueue a definition.
    pub fn submit(&self, definition: JobDefinition) -> Result<JobId, SchedulerError> {
        definition.validate()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let seq = inner.next_seq;
        let max_retries = definition.max_retries.unwrap_or(self.defaults.max_retries);
        let execution_timeout = definition
            .execution_timeout
            .unwrap_or(self.defaults.execution_timeout);
        let mut job = Job::new(definition, seq, max_retries, execution_timeout, now);
        let placement = job.definition.schedule.first_placement(now);
        job.transition(JobState::Scheduled, now)?;
        let entry = ScheduleEntry::regular(job.id, seq, placement);

        self.store.commit(&job, Some(&entry))?;
        inner.next_seq += 1;
        inner.queue.insert(entry);
        info!(
            job_id = %job.id,
            job = %job.name(),
            endpoint = %job.endpoint_id(),
            fire_at = %placement.fire_at,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Cancel a job.
    ///
    /// A queued job moves straight to `Cancelled`. A running job is signalled
    /// and becomes `Cancelled` when its worker stops at the next command
    /// boundary. Unknown and terminal jobs yield [`SchedulerError::NotFound`]
    /// and are left untouched.
    pub fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        if let Some(running) = inner.running.get_mut(id) {
            running.cancel_requested = true;
            running.cancel.cancel();
            info!(job_id = %id, "Cancellation signalled to running job");
            return Ok(());
        }

        let mut job = self
            .store
            .get(id)?
            .map(|record| record.job)
            .filter(|job| !job.state.is_terminal())
            .ok_or(SchedulerError::NotFound(*id))?;
        job.transition(JobState::Cancelled, self.clock.now())?;
        self.store.commit(&job, None)?;
        inner.queue.remove(id);
        info!(job_id = %id, "Job cancelled");
        Ok(())
    }

    /// Id of the job that would be dispatched next at `now`.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.inner.lock().queue.peek_due(now).map(|entry| entry.job_id)
    }

    /// Fire time of the earliest queued entry.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().queue.next_fire()
    }

    /// Move the next due job to `Running` and hand it out.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Option<Dispatch>, SchedulerError> {
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.queue.pop_due(now) {
            let record = match self.store.get(&entry.job_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(job_id = %entry.job_id, "Dropping schedule entry for missing job");
                    continue;
                }
                Err(e) => {
                    inner.queue.insert(entry);
                    return Err(e.into());
                }
            };
            let mut job = record.job;
            if let Err(e) = job.transition(JobState::Running, now) {
                warn!(job_id = %job.id, error = %e, "Dropping schedule entry for job that cannot run");
                continue;
            }
            if entry.kind == EntryKind::Regular {
                job.retry_count = 0;
            }
            if let Err(e) = self.store.commit(&job, Some(&entry)) {
                inner.queue.insert(entry);
                return Err(e.into());
            }

            let (handle, token) = cancel_pair();
            debug!(job_id = %job.id, slot = %entry.slot, kind = ?entry.kind, "Job dispatched");
            inner.running.insert(
                job.id,
                RunningJob {
                    entry,
                    cancel: handle,
                    cancel_requested: false,
                },
            );
            return Ok(Some(Dispatch { job, cancel: token }));
        }
        Ok(None)
    }

    /// Record the outcome of a dispatched job and re-arm it when it recurs.
    pub fn complete(&self, id: &JobId, report: ExecutionReport) -> Result<Job, SchedulerError> {
        let mut inner = self.inner.lock();
        let running = inner
            .running
            .remove(id)
            .ok_or(SchedulerError::NotFound(*id))?;
        let mut job = self
            .store
            .get(id)?
            .map(|record| record.job)
            .ok_or(SchedulerError::NotFound(*id))?;
        let now = self.clock.now();
        job.retry_count = report.retry_count;

        let error = match report.outcome {
            _ if running.cancel_requested => Some(cancelled_error()),
            Outcome::Cancelled => Some(cancelled_error()),
            Outcome::Unavailable(error) if job.retry_count < job.max_retries => {
                job.retry_count += 1;
                let delay = self.retry.delay_for(job.retry_count);
                let backoff = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let entry = running.entry.retry_at(now + backoff);
                job.last_error = Some(error);
                job.transition(JobState::Scheduled, now)?;
                self.store.commit(&job, Some(&entry))?;
                info!(
                    job_id = %job.id,
                    retry = job.retry_count,
                    fire_at = %entry.fire_at,
                    "Endpoint unavailable, job re-queued"
                );
                inner.queue.insert(entry);
                return Ok(job);
            }
            Outcome::Succeeded => None,
            Outcome::Failed(error) | Outcome::Unavailable(error) => Some(error),
        };

        if error.as_ref().is_some_and(|e| e.kind == ErrorKind::Cancelled) {
            job.last_error = error;
            job.transition(JobState::Cancelled, now)?;
            self.store.commit(&job, None)?;
            info!(job_id = %job.id, "Running job cancelled");
            return Ok(job);
        }

        let succeeded = error.is_none();
        job.run_count += 1;
        job.last_run = Some(RunRecord {
            slot: running.entry.slot,
            finished_at: now,
            succeeded,
            responses: report.responses,
            error: error.clone(),
        });
        job.last_error = error;
        let finished = if succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        job.transition(finished, now)?;

        match job.definition.schedule.next_placement(running.entry.slot, now) {
            Some(placement) => {
                job.transition(JobState::Scheduled, now)?;
                let entry = ScheduleEntry::regular(job.id, job.seq, placement);
                self.store.commit(&job, Some(&entry))?;
                debug!(
                    job_id = %job.id,
                    outcome = %finished,
                    slot = %placement.slot,
                    fire_at = %placement.fire_at,
                    "Recurring job re-armed"
                );
                inner.queue.insert(entry);
            }
            None => {
                self.store.commit(&job, None)?;
                info!(job_id = %job.id, outcome = %finished, "Job finished");
            }
        }
        Ok(job)
    }

    /// Rebuild the queue from the store.
    ///
    /// Overdue entries fire once immediately with missed slots coalesced; jobs
    /// interrupted while `Running` fire immediately.
    pub fn rehydrate(&self) -> Result<RehydrateSummary, SchedulerError> {
        let now = self.clock.now();
        let records = self.store.list()?;
        let mut inner = self.inner.lock();
        let mut summary = RehydrateSummary::default();

        for record in records {
            inner.next_seq = inner.next_seq.max(record.job.seq + 1);
            let mut job = record.job;
            if job.state.is_terminal() {
                summary.finished += 1;
                continue;
            }
            if inner.running.contains_key(&job.id) {
                continue;
            }

            let entry = match (job.state, record.entry) {
                (JobState::Running, entry) => {
                    summary.overdue += 1;
                    warn!(job_id = %job.id, "Job was interrupted while running, re-queued");
                    match entry {
                        // keeps the retry budget already spent on this slot
                        Some(entry) if entry.kind == EntryKind::Retry => entry.retry_at(now),
                        entry => {
                            let slot = entry.map_or(now, |entry| entry.slot);
                            ScheduleEntry::regular(job.id, job.seq, Placement { slot, fire_at: now })
                        }
                    }
                }
                (_, Some(entry)) if entry.fire_at > now => entry,
                (_, Some(entry)) => {
                    summary.overdue += 1;
                    match entry.kind {
                        EntryKind::Retry => entry.retry_at(now),
                        EntryKind::Regular => ScheduleEntry::regular(
                            job.id,
                            job.seq,
                            job.definition.schedule.catch_up(entry.slot, now),
                        ),
                    }
                }
                (_, None) => ScheduleEntry::regular(
                    job.id,
                    job.seq,
                    job.definition.schedule.first_placement(now),
                ),
            };
            if job.state != JobState::Scheduled {
                job.transition(JobState::Scheduled, now)?;
            }
            self.store.commit(&job, Some(&entry))?;
            debug!(job_id = %job.id, fire_at = %entry.fire_at, "Job rehydrated");
            inner.queue.insert(entry);
            summary.requeued += 1;
        }

        info!(
            requeued = summary.requeued,
            overdue = summary.overdue,
            finished = summary.finished,
            "Scheduler rehydrated"
        );
        Ok(summary)
    }

    /// Current job record.
    pub fn get(&self, id: &JobId) -> Result<Job, SchedulerError> {
        self.store
            .get(id)?
            .map(|record| record.job)
            .ok_or(SchedulerError::NotFound(*id))
    }

    /// The job's pending schedule entry (queued or running).
    pub fn entry(&self, id: &JobId) -> Option<ScheduleEntry> {
        let inner = self.inner.lock();
        inner
            .queue
            .get(id)
            .cloned()
            .or_else(|| inner.running.get(id).map(|running| running.entry.clone()))
    }

    /// Jobs matching `filter`, in submission order.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, SchedulerError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|record| record.job)
            .filter(|job| filter.matches(job))
            .collect())
    }

    /// Remove a job that is not running.
    pub fn delete(&self, id: &JobId) -> Result<Job, SchedulerError> {
        let mut inner = self.inner.lock();
        if inner.running.contains_key(id) {
            return Err(SchedulerError::Running(*id));
        }
        let job = self
            .store
            .get(id)?
            .map(|record| record.job)
            .ok_or(SchedulerError::NotFound(*id))?;
        self.store.delete(id)?;
        inner.queue.remove(id);
        info!(job_id = %id, "Job deleted");
        Ok(job)
    }

    /// Delete terminal jobs that finished more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> Result<usize, SchedulerError> {
        let cutoff = match chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return Ok(0),
        };
        let _inner = self.inner.lock();
        let mut purged = 0;
        for record in self.store.list()? {
            let job = record.job;
            let expired = job.state.is_terminal()
                && job.finished_at.is_some_and(|finished| finished <= cutoff);
            if expired && self.store.delete(&job.id)? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }

    /// Signal every running job to stop.
    pub fn cancel_all_running(&self) -> usize {
        let mut inner = self.inner.lock();
        for running in inner.running.values_mut() {
            running.cancel_requested = true;
            running.cancel.cancel();
        }
        inner.running.len()
    }

    /// Number of jobs currently dispatched.
    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    /// Number of queued entries.
    pub fn queued_count(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

fn cancelled_error() -> JobError {
    JobError::new(ErrorKind::Cancelled, "cancelled while running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use sonaris_core::{Command, ScheduleRule};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn setup() -> (Scheduler, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8)),
            JobDefaults::default(),
        );
        (scheduler, clock, store)
    }

    fn definition(name: &str) -> JobDefinition {
        JobDefinition::new(name, "dg4202").command(Command::write(":OUTP1 ON"))
    }

    fn report(outcome: Outcome, retry_count: u32) -> ExecutionReport {
        ExecutionReport {
            outcome,
            retry_count,
            attempts: 1,
            responses: Vec::new(),
        }
    }

    #[test]
    fn submit_schedules_and_dispatches_in_order() {
        let (scheduler, clock, _) = setup();
        let first = scheduler.submit(definition("first")).expect("submit");
        let second = scheduler.submit(definition("second")).expect("submit");
        let later = scheduler
            .submit(definition("later").with_schedule(ScheduleRule::once_at(
                start() + chrono::Duration::seconds(10),
            )))
            .expect("submit");

        assert_eq!(scheduler.get(&first).expect("job").state, JobState::Scheduled);
        assert_eq!(scheduler.next_due(clock.now()), Some(first));

        let dispatch = scheduler.take_due(clock.now()).expect("take").expect("due");
        assert_eq!(dispatch.job.id, first);
        assert_eq!(dispatch.job.state, JobState::Running);
        let dispatch = scheduler.take_due(clock.now()).expect("take").expect("due");
        assert_eq!(dispatch.job.id, second);
        assert!(scheduler.take_due(clock.now()).expect("take").is_none());

        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.next_due(clock.now()), Some(later));
    }

    #[test]
    fn invalid_definition_is_rejected() {
        let (scheduler, _, store) = setup();
        let err = scheduler
            .submit(JobDefinition::new("empty", "dg4202"))
            .expect_err("no commands");
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn cancel_queued_then_terminal_is_not_found() {
        let (scheduler, clock, _) = setup();
        let id = scheduler.submit(definition("toggle")).expect("submit");
        scheduler.cancel(&id).expect("cancel");
        let job = scheduler.get(&id).expect("job");
        assert_eq!(job.state, JobState::Cancelled);
        assert!(scheduler.next_due(clock.now()).is_none());

        let err = scheduler.cancel(&id).expect_err("terminal");
        assert!(matches!(err, SchedulerError::NotFound(_)));
        assert_eq!(scheduler.get(&id).expect("job"), job);

        let unknown = scheduler.cancel(&JobId::new()).expect_err("unknown");
        assert_eq!(unknown.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn cancel_running_signals_worker() {
        let (scheduler, clock, _) = setup();
        let id = scheduler.submit(definition("toggle")).expect("submit");
        let dispatch = scheduler.take_due(clock.now()).expect("take").expect("due");
        scheduler.cancel(&id).expect("cancel");
        assert!(dispatch.cancel.is_cancelled());
        assert_eq!(scheduler.get(&id).expect("job").state, JobState::Running);

        let job = scheduler
            .complete(&id, report(Outcome::Cancelled, 0))
            .expect("complete");
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.last_error.map(|e| e.kind), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn one_shot_success_is_terminal() {
        let (scheduler, clock, store) = setup();
        let id = scheduler.submit(definition("toggle")).expect("submit");
        scheduler.take_due(clock.now()).expect("take");
        clock.advance(Duration::from_millis(300));
        let job = scheduler
            .complete(&id, report(Outcome::Succeeded, 0))
            .expect("complete");
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.finished_at, Some(clock.now()));
        let record = store.get(&id).expect("get").expect("record");
        assert!(record.entry.is_none());
    }

    #[test]
    fn recurring_rearms_from_slot_not_completion() {
        let (scheduler, clock, _) = setup();
        let every = Duration::from_secs(10);
        let id = scheduler
            .submit(definition("poll").with_schedule(ScheduleRule::every(every)))
            .expect("submit");

        scheduler.take_due(clock.now()).expect("take");
        clock.advance(Duration::from_secs(3));
        let job = scheduler
            .complete(&id, report(Outcome::Succeeded, 0))
            .expect("complete");
        assert_eq!(job.state, JobState::Scheduled);

        let entry = scheduler.entry(&id).expect("re-armed");
        assert_eq!(entry.slot, start() + chrono::Duration::seconds(10));
        assert_eq!(entry.fire_at, entry.slot);
    }

    #[test]
    fn overrun_fires_once_and_keeps_grid() {
        let (scheduler, clock, _) = setup();
        let id = scheduler
            .submit(definition("poll").with_schedule(ScheduleRule::every(Duration::from_secs(10))))
            .expect("submit");

        scheduler.take_due(clock.now()).expect("take");
        clock.advance(Duration::from_secs(35));
        scheduler
            .complete(&id, report(Outcome::Failed(JobError::new(ErrorKind::Io, "gone")), 3))
            .expect("complete");

        let entry = scheduler.entry(&id).expect("re-armed");
        assert_eq!(entry.slot, start() + chrono::Duration::seconds(30));
        assert_eq!(entry.fire_at, clock.now());

        scheduler.take_due(clock.now()).expect("take").expect("due");
        clock.advance(Duration::from_secs(1));
        scheduler
            .complete(&id, report(Outcome::Succeeded, 0))
            .expect("complete");
        let entry = scheduler.entry(&id).expect("re-armed");
        assert_eq!(entry.fire_at, start() + chrono::Duration::seconds(40));
    }

    #[test]
    fn unavailable_requeues_with_backoff_until_budget_spent() {
        let (scheduler, clock, _) = setup();
        let id = scheduler
            .submit(definition("toggle").with_max_retries(1))
            .expect("submit");
        let busy = || Outcome::Unavailable(JobError::new(ErrorKind::ResourceUnavailable, "busy"));

        scheduler.take_due(clock.now()).expect("take");
        let job = scheduler.complete(&id, report(busy(), 0)).expect("complete");
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.retry_count, 1);
        let entry = scheduler.entry(&id).expect("queued");
        assert_eq!(entry.kind, EntryKind::Retry);
        assert_eq!(entry.fire_at, clock.now() + chrono::Duration::seconds(1));
        assert!(scheduler.next_due(clock.now()).is_none());

        clock.advance(Duration::from_secs(1));
        let dispatch = scheduler.take_due(clock.now()).expect("take").expect("due");
        assert_eq!(dispatch.job.retry_count, 1);
        let job = scheduler.complete(&id, report(busy(), 1)).expect("complete");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.last_error.map(|e| e.kind),
            Some(ErrorKind::ResourceUnavailable)
        );
    }

    #[test]
    fn rehydrate_coalesces_overdue_recurring_job() {
        let (scheduler, clock, store) = setup();
        let id = scheduler
            .submit(definition("poll").with_schedule(ScheduleRule::every(Duration::from_secs(10))))
            .expect("submit");
        scheduler.take_due(clock.now()).expect("take");
        scheduler
            .complete(&id, report(Outcome::Succeeded, 0))
            .expect("complete");
        let done = scheduler.submit(definition("once")).expect("submit");
        scheduler.take_due(clock.now()).expect("take");
        scheduler.complete(&done, report(Outcome::Succeeded, 0)).expect("complete");

        clock.advance(Duration::from_secs(65));
        let restarted = Scheduler::new(
            store,
            clock.clone(),
            RetryPolicy::default(),
            JobDefaults::default(),
        );
        let summary = restarted.rehydrate().expect("rehydrate");
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.overdue, 1);
        assert_eq!(summary.finished, 1);

        let entry = restarted.entry(&id).expect("queued");
        assert_eq!(entry.slot, start() + chrono::Duration::seconds(60));
        assert_eq!(entry.fire_at, clock.now());

        let next = restarted.submit(definition("next")).expect("submit");
        assert_eq!(restarted.get(&next).expect("job").seq, 2);
    }

    #[test]
    fn rehydrate_requeues_interrupted_run() {
        let (scheduler, clock, store) = setup();
        let id = scheduler.submit(definition("toggle")).expect("submit");
        scheduler.take_due(clock.now()).expect("take");

        clock.advance(Duration::from_secs(5));
        let restarted = Scheduler::new(store, clock.clone(), RetryPolicy::default(), JobDefaults::default());
        restarted.rehydrate().expect("rehydrate");
        assert_eq!(restarted.get(&id).expect("job").state, JobState::Scheduled);
        assert_eq!(restarted.next_due(clock.now()), Some(id));
    }

    #[test]
    fn rehydrate_keeps_retry_count_of_interrupted_retry() {
        let (scheduler, clock, store) = setup();
        let id = scheduler
            .submit(definition("toggle").with_max_retries(3))
            .expect("submit");
        let busy = Outcome::Unavailable(JobError::new(ErrorKind::ResourceUnavailable, "busy"));

        scheduler.take_due(clock.now()).expect("take");
        scheduler.complete(&id, report(busy, 0)).expect("complete");
        clock.advance(Duration::from_secs(1));
        let dispatch = scheduler.take_due(clock.now()).expect("take").expect("due");
        assert_eq!(dispatch.job.retry_count, 1);

        clock.advance(Duration::from_secs(5));
        let restarted = Scheduler::new(store, clock.clone(), RetryPolicy::default(), JobDefaults::default());
        restarted.rehydrate().expect("rehydrate");
        assert_eq!(restarted.entry(&id).expect("queued").kind, EntryKind::Retry);

        let dispatch = restarted.take_due(clock.now()).expect("take").expect("due");
        assert_eq!(dispatch.job.retry_count, 1);
    }

    #[test]
    fn purge_and_delete() {
        let (scheduler, clock, _) = setup();
        let finished = scheduler.submit(definition("a")).expect("submit");
        let queued = scheduler
            .submit(definition("b").with_schedule(ScheduleRule::once_at(
                start() + chrono::Duration::hours(1),
            )))
            .expect("submit");
        scheduler.take_due(clock.now()).expect("take");
        scheduler
            .complete(&finished, report(Outcome::Succeeded, 0))
            .expect("complete");

        assert_eq!(scheduler.purge_finished(Duration::from_secs(60)).expect("purge"), 0);
        clock.advance(Duration::from_secs(120));
        assert_eq!(scheduler.purge_finished(Duration::from_secs(60)).expect("purge"), 1);
        assert!(matches!(scheduler.get(&finished), Err(SchedulerError::NotFound(_))));

        scheduler.delete(&queued).expect("delete");
        assert_eq!(scheduler.queued_count(), 0);
        assert!(scheduler.delete(&queued).is_err());
    }

    #[test]
    fn list_filters() {
        let (scheduler, _, _) = setup();
        let a = scheduler.submit(definition("Toggle Output")).expect("submit");
        scheduler
            .submit(JobDefinition::new("scope", "edux").command(Command::write(":AUT")))
            .expect("submit");
        scheduler.cancel(&a).expect("cancel");

        let all = scheduler.list(&JobFilter::all()).expect("list");
        assert_eq!(all.len(), 2);
        let cancelled = scheduler
            .list(&JobFilter::all().with_state(JobState::Cancelled))
            .expect("list");
        assert_eq!(cancelled.len(), 1);
        let by_endpoint = scheduler
            .list(&JobFilter::all().with_endpoint("edux"))
            .expect("list");
        assert_eq!(by_endpoint[0].name(), "scope");
        let by_name = scheduler
            .list(&JobFilter::all().with_name("toggle"))
            .expect("list");
        assert_eq!(by_name[0].id, a);
    }
}
