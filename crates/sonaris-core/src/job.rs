//! Jobs, command sequences and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{DefinitionError, JobError, TransitionError};
use crate::schedule::ScheduleRule;
use crate::validator::ResponseValidator;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether a command reads a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    /// Send without reading a response.
    Write,
    /// Send and read one response.
    Query,
}

/// One step of a job's command sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Write or query.
    pub op: CommandOp,
    /// Command text, without terminator.
    pub text: String,
    /// Check applied to a query response. Must be `Any` for writes.
    #[serde(default, skip_serializing_if = "ResponseValidator::is_any")]
    pub validator: ResponseValidator,
    /// Per-command timeout; the engine default applies when absent.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Command {
    /// A write command.
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            op: CommandOp::Write,
            text: text.into(),
            validator: ResponseValidator::Any,
            timeout: None,
        }
    }

    /// A query command accepting any response.
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            op: CommandOp::Query,
            text: text.into(),
            validator: ResponseValidator::Any,
            timeout: None,
        }
    }

    /// Attach a response validator.
    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Set the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Raw command text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True for queries.
    pub fn is_query(&self) -> bool {
        self.op == CommandOp::Query
    }

    /// SCPI header of the command: the text up to the first space, upper-cased.
    pub fn header(&self) -> String {
        self.text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// What a client submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Display name.
    pub name: String,
    /// Target endpoint.
    pub endpoint_id: String,
    /// Commands run in order within one session.
    pub commands: Vec<Command>,
    /// When to run.
    #[serde(default)]
    pub schedule: ScheduleRule,
    /// Retry budget for transient failures; engine default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Upper bound for one attempt of the whole sequence; engine default when absent.
    #[serde(default, with = "humantime_serde")]
    pub execution_timeout: Option<Duration>,
}

impl JobDefinition {
    /// New one-shot definition with no commands.
    pub fn new(name: impl Into<String>, endpoint_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint_id: endpoint_id.into(),
            commands: Vec::new(),
            schedule: ScheduleRule::default(),
            max_retries: None,
            execution_timeout: None,
        }
    }

    /// Append a command.
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Replace the command list.
    pub fn with_commands(mut self, commands: Vec<Command>) -> Self {
        self.commands = commands;
        self
    }

    /// Set the schedule.
    pub fn with_schedule(mut self, schedule: ScheduleRule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Structural checks that do not depend on the endpoint.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.endpoint_id.trim().is_empty() {
            return Err(DefinitionError::MissingEndpoint(self.name.clone()));
        }
        if self.commands.is_empty() {
            return Err(DefinitionError::NoCommands(self.name.clone()));
        }
        for (index, command) in self.commands.iter().enumerate() {
            if command.text().trim().is_empty() {
                return Err(DefinitionError::EmptyCommand {
                    job: self.name.clone(),
                    index,
                });
            }
            if !command.is_query() && !command.validator.is_any() {
                return Err(DefinitionError::ValidatorOnWrite {
                    job: self.name.clone(),
                    index,
                });
            }
            command
                .validator
                .check_definition()
                .map_err(|reason| DefinitionError::InvalidValidator {
                    job: self.name.clone(),
                    index,
                    reason,
                })?;
        }
        if let Some(every) = self.schedule.interval() {
            if every.as_millis() == 0 {
                return Err(DefinitionError::ZeroInterval(self.name.clone()));
            }
        }
        if self.execution_timeout == Some(Duration::ZERO) {
            return Err(DefinitionError::ZeroTimeout(self.name.clone()));
        }
        Ok(())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but not yet queued.
    Pending,
    /// Waiting in the schedule queue.
    Scheduled,
    /// Dispatched to the executor.
    Running,
    /// Last run of a one-shot job succeeded.
    Succeeded,
    /// Last run of a one-shot job failed.
    Failed,
    /// Cancelled by a client.
    Cancelled,
}

impl JobState {
    /// Terminal states accept no further transitions (except recurring re-arm).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        match (self, to) {
            (Pending, Scheduled | Cancelled) => true,
            (Scheduled, Running | Cancelled) => true,
            // Running re-enters Scheduled when re-queued or rehydrated after a crash
            (Running, Succeeded | Failed | Cancelled | Scheduled) => true,
            // recurring jobs re-arm after each run
            (Succeeded | Failed, Scheduled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Grid slot the run belonged to.
    pub slot: DateTime<Utc>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
    /// Whether the run succeeded.
    pub succeeded: bool,
    /// Query responses in command order.
    #[serde(default)]
    pub responses: Vec<String>,
    /// Failure, if any.
    #[serde(default)]
    pub error: Option<JobError>,
}

/// A submitted job and its mutable status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier.
    pub id: JobId,
    /// Submission sequence number, strictly increasing per engine.
    pub seq: u64,
    /// What to run.
    pub definition: JobDefinition,
    /// Resolved retry budget.
    pub max_retries: u32,
    /// Resolved execution timeout.
    #[serde(with = "humantime_serde")]
    pub execution_timeout: Duration,
    /// Current state.
    pub state: JobState,
    /// Retries consumed by the current (or last) run.
    pub retry_count: u32,
    /// Most recent terminal failure.
    #[serde(default)]
    pub last_error: Option<JobError>,
    /// Most recent completed run.
    #[serde(default)]
    pub last_run: Option<RunRecord>,
    /// Number of completed runs.
    #[serde(default)]
    pub run_count: u64,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Set once the job reaches a terminal state.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New job in `Pending`.
    pub fn new(
        definition: JobDefinition,
        seq: u64,
        max_retries: u32,
        execution_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            seq,
            definition,
            max_retries,
            execution_timeout,
            state: JobState::Pending,
            retry_count: 0,
            last_error: None,
            last_run: None,
            run_count: 0,
            submitted_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Target endpoint id.
    pub fn endpoint_id(&self) -> &str {
        &self.definition.endpoint_id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// True when the job re-arms after each run.
    pub fn is_recurring(&self) -> bool {
        self.definition.schedule.is_recurring()
    }

    /// Move to `to`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = now;
        self.finished_at = if to.is_terminal() { Some(now) } else { None };
        Ok(())
    }
}
