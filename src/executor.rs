//! Job execution.
//!
//! Runs one job against one session: acquire, send each command in order,
//! validate responses, retry transient failures with exponential backoff and
//! always release the session on the way out.

use sonaris_core::{ErrorKind, Job, JobError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SonarisConfig;
use crate::error_recovery::RetryPolicy;
use crate::session::{PendingAcquire, Session, SessionError, SessionManager};

/// Sends the cancellation signal for one running job.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Ask the job to stop at its next command boundary.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes the cancellation signal for one running job.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancel_pair().1
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A linked cancel handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Timing and retry parameters for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Bound on waiting for the endpoint (`T_acquire`).
    pub acquire_timeout: Duration,
    /// Added to the job's execution timeout to size its lease.
    pub lease_margin: Duration,
    /// Per-command timeout when the command does not set one.
    pub command_timeout: Duration,
    /// Backoff between attempts.
    pub retry: RetryPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            lease_margin: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&SonarisConfig> for ExecutionPolicy {
    fn from(config: &SonarisConfig) -> Self {
        Self {
            acquire_timeout: config.scheduler.acquire_timeout,
            lease_margin: config.lease.margin,
            command_timeout: config.execution.command_timeout,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every command ran and every response validated.
    Succeeded,
    /// Terminal failure (validation, parse, exhausted retries, faulted endpoint).
    Failed(JobError),
    /// The endpoint could not be acquired in time; the scheduler may re-queue.
    Unavailable(JobError),
    /// Stopped on request.
    Cancelled,
}

/// Result of [`Executor::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// How the run ended.
    pub outcome: Outcome,
    /// Retry count after this run (carried in from the job).
    pub retry_count: u32,
    /// Attempts made in this run.
    pub attempts: u32,
    /// Query responses of the successful attempt.
    pub responses: Vec<String>,
}

/// A job whose place in the endpoint queue is already reserved.
#[derive(Debug)]
pub struct PreparedRun {
    job: Job,
    acquisition: Result<PendingAcquire, SessionError>,
}

impl PreparedRun {
    /// The job to run.
    pub fn job(&self) -> &Job {
        &self.job
    }
}

enum AttemptError {
    Cancelled,
    Failed(JobError),
}

/// Runs jobs against sessions from a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct Executor {
    sessions: SessionManager,
    policy: ExecutionPolicy,
}

impl Executor {
    /// New executor.
    pub fn new(sessions: SessionManager, policy: ExecutionPolicy) -> Self {
        Self { sessions, policy }
    }

    /// Policy in use.
    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Lease requested for `job`: its execution timeout plus the margin.
    pub fn lease_for(&self, job: &Job) -> Duration {
        job.execution_timeout + self.policy.lease_margin
    }

    /// Reserve the job's place in its endpoint queue. Call from the dispatcher,
    /// in dispatch order.
    pub fn prepare(&self, job: Job) -> PreparedRun {
        let acquisition = self
            .sessions
            .enqueue(job.endpoint_id(), job.id, self.lease_for(&job));
        PreparedRun { job, acquisition }
    }

    /// Prepare and run in one step.
    pub async fn execute(&self, job: Job, cancel: CancelToken) -> ExecutionReport {
        let prepared = self.prepare(job);
        self.run(prepared, cancel).await
    }

    /// Run a prepared job to completion.
    pub async fn run(&self, prepared: PreparedRun, cancel: CancelToken) -> ExecutionReport {
        let span = info_span!(
            "execute",
            job_id = %prepared.job.id,
            job = %prepared.job.name(),
            endpoint = %prepared.job.endpoint_id()
        );
        self.run_inner(prepared, cancel).instrument(span).await
    }

    async fn run_inner(&self, prepared: PreparedRun, mut cancel: CancelToken) -> ExecutionReport {
        let PreparedRun { job, acquisition } = prepared;
        let mut report = ExecutionReport {
            outcome: Outcome::Succeeded,
            retry_count: job.retry_count,
            attempts: 0,
            responses: Vec::new(),
        };

        let pending = match acquisition {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Endpoint refused session");
                report.outcome = Outcome::Failed(unavailable(&e));
                return report;
            }
        };
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelled while waiting for endpoint");
                report.outcome = Outcome::Cancelled;
                return report;
            }
            acquired = pending.wait(self.policy.acquire_timeout) => acquired,
        };
        let session = match acquired {
            Ok(session) => session,
            Err(e @ SessionError::Busy { .. }) => {
                warn!(error = %e, "Endpoint unavailable");
                report.outcome = Outcome::Unavailable(unavailable(&e));
                return report;
            }
            Err(e) => {
                warn!(error = %e, "Session acquisition failed");
                report.outcome = Outcome::Failed(unavailable(&e));
                return report;
            }
        };

        report.outcome = loop {
            if cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            if let Err(e) = session.heartbeat() {
                break Outcome::Failed(JobError::new(e.kind(), e.to_string()));
            }
            report.attempts += 1;
            debug!(attempt = report.attempts, "Running command sequence");

            let attempt = tokio::time::timeout(
                job.execution_timeout,
                self.run_commands(&session, &job, &cancel),
            )
            .await;
            let error = match attempt {
                Ok(Ok(responses)) => {
                    report.responses = responses;
                    break Outcome::Succeeded;
                }
                Ok(Err(AttemptError::Cancelled)) => break Outcome::Cancelled,
                Ok(Err(AttemptError::Failed(error))) => error,
                Err(_) => JobError::new(
                    ErrorKind::Timeout,
                    format!("attempt exceeded execution timeout of {:?}", job.execution_timeout),
                ),
            };

            if !error.is_transient() || report.retry_count >= job.max_retries {
                break Outcome::Failed(error);
            }
            report.retry_count += 1;
            let delay = self.policy.retry.delay_for(report.retry_count);
            warn!(
                error = %error,
                retry = report.retry_count,
                max_retries = job.max_retries,
                delay = ?delay,
                "Transient failure, retrying"
            );
            if let Some(stopped) = self
                .back_off(&session, delay, self.lease_for(&job), &mut cancel)
                .await
            {
                break stopped;
            }
        };

        session.release();
        match &report.outcome {
            Outcome::Succeeded => info!(attempts = report.attempts, retries = report.retry_count, "Job run succeeded"),
            Outcome::Cancelled => info!("Job run cancelled"),
            Outcome::Failed(e) | Outcome::Unavailable(e) => {
                warn!(error = %e, retries = report.retry_count, "Job run failed")
            }
        }
        report
    }

    /// Sleep out a retry delay while holding the session, renewing the lease
    /// at least every half lease so the sweep does not revoke it.
    async fn back_off(
        &self,
        session: &Session,
        delay: Duration,
        lease: Duration,
        cancel: &mut CancelToken,
    ) -> Option<Outcome> {
        let step = (lease / 2).max(Duration::from_millis(1));
        let deadline = Instant::now() + delay;
        loop {
            if let Err(e) = session.heartbeat() {
                return Some(Outcome::Failed(JobError::new(e.kind(), e.to_string())));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let nap = (deadline - now).min(step);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(Outcome::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn run_commands(
        &self,
        session: &Session,
        job: &Job,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, AttemptError> {
        let mut responses = Vec::new();
        for (index, command) in job.definition.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let timeout = command.timeout.unwrap_or(self.policy.command_timeout);
            let step = index + 1;
            if command.is_query() {
                let response = session
                    .query(command.text(), timeout)
                    .await
                    .map_err(|e| command_error(step, command.text(), &e))?;
                command.validator.check(&response).map_err(|e| {
                    AttemptError::Failed(JobError::new(
                        e.kind,
                        format!("command {step} '{}': {}", command.text(), e.message),
                    ))
                })?;
                responses.push(response);
            } else {
                session
                    .write(command.text(), timeout)
                    .await
                    .map_err(|e| command_error(step, command.text(), &e))?;
            }
            session
                .heartbeat()
                .map_err(|e| command_error(step, command.text(), &e))?;
        }
        Ok(responses)
    }
}

fn command_error(step: usize, text: &str, error: &SessionError) -> AttemptError {
    AttemptError::Failed(JobError::new(
        error.kind(),
        format!("command {step} '{text}': {error}"),
    ))
}

fn unavailable(error: &SessionError) -> JobError {
    JobError::new(ErrorKind::ResourceUnavailable, error.to_string())
}
