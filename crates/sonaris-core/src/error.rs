//! Error taxonomy shared by every layer.
//!
//! Failures are classified by [`ErrorKind`] so the executor can decide whether
//! to retry with a single [`ErrorKind::is_transient`] check. [`JobError`] is the
//! persisted form recorded as a job's `last_error`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::job::JobState;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Endpoint is held by another session.
    Busy,
    /// An operation did not complete in time.
    Timeout,
    /// Transport-level failure talking to the instrument.
    Io,
    /// The instrument answered with something that could not be decoded.
    Parse,
    /// A response was decoded but rejected by its validator.
    ValidationFailure,
    /// No session could be acquired for the target endpoint.
    ResourceUnavailable,
    /// Unknown job or endpoint.
    NotFound,
    /// The endpoint is faulted and needs an administrative reset.
    Faulted,
    /// The job was cancelled while running.
    Cancelled,
}

impl ErrorKind {
    /// Transient failures are retried by the executor; everything else is terminal.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Io)
    }

    /// Stable identifier used in logs and persisted records.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Busy => "busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
            ErrorKind::Parse => "parse",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Faulted => "faulted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl JobError {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for `self.kind.is_transient()`.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// A job definition was rejected before it was queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("job '{0}' has no commands")]
    NoCommands(String),

    #[error("job '{0}' has an empty endpoint id")]
    MissingEndpoint(String),

    #[error("command {index} of job '{job}' is empty")]
    EmptyCommand { job: String, index: usize },

    #[error("command {index} of job '{job}' is a write but carries a response validator")]
    ValidatorOnWrite { job: String, index: usize },

    #[error("command {index} of job '{job}' has an invalid validator: {reason}")]
    InvalidValidator {
        job: String,
        index: usize,
        reason: String,
    },

    #[error("job '{0}' has a zero repeat interval")]
    ZeroInterval(String),

    #[error("job '{0}' has a zero execution timeout")]
    ZeroTimeout(String),

    #[error("command '{command}' is not supported by endpoint '{endpoint}'")]
    UnsupportedCommand { endpoint: String, command: String },
}

/// An illegal job state transition was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job state transition {from:?} -> {to:?}")]
pub struct TransitionError {
    /// State the job was in.
    pub from: JobState,
    /// State that was requested.
    pub to: JobState,
}
