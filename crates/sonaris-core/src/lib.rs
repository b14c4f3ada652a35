//! Core types for the sonaris scheduling engine.
//!
//! This crate holds the data model shared by the session manager, scheduler,
//! executor and state store:
//!
//! - [`job`]: job definitions, command sequences and the job state machine
//! - [`schedule`]: one-shot and interval schedules, and the entries that bind a
//!   job to its next fire time
//! - [`validator`]: response checks applied to query results
//! - [`endpoint`]: instrument endpoint descriptors and connection state
//! - [`error`]: the persisted error taxonomy used to drive retry decisions
//!
//! Everything here is plain data that serializes with `serde`, so a job record
//! can be written to disk and rehydrated after a restart.

pub mod endpoint;
pub mod error;
pub mod job;
pub mod schedule;
pub mod validator;

pub use endpoint::{EndpointDescriptor, EndpointState, EndpointStatus};
pub use error::{DefinitionError, ErrorKind, JobError, TransitionError};
pub use job::{Command, CommandOp, Job, JobDefinition, JobId, JobState, RunRecord};
pub use schedule::{EntryKind, Placement, ScheduleEntry, ScheduleRule};
pub use validator::ResponseValidator;
