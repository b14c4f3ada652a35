//! Custom error types for the application.
//!
//! Each layer has its own `thiserror` enum (`DriverError`, `SessionError`,
//! `StoreError`, `SchedulerError`, `ConfigError`, `TaskError`). `SonarisError`
//! consolidates them for the public facade so callers can use `?` across
//! layers and still classify the failure through [`SonarisError::kind`].

use sonaris_core::{DefinitionError, ErrorKind, JobId};
use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::scheduler::SchedulerError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::tasks::TaskError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SonarisError>;

#[derive(Error, Debug)]
pub enum SonarisError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid job definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Endpoint '{0}' is not registered")]
    EndpointNotFound(String),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Endpoint '{endpoint}' is faulted: {reason}")]
    EndpointFaulted { endpoint: String, reason: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Endpoint '{endpoint}' identified as '{actual}', expected '{expected}'")]
    IdentityMismatch {
        endpoint: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl SonarisError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SonarisError::EndpointNotFound(_) | SonarisError::JobNotFound(_) => {
                ErrorKind::NotFound
            }
            SonarisError::EndpointFaulted { .. } => ErrorKind::ResourceUnavailable,
            SonarisError::Driver(e) => e.kind(),
            SonarisError::Session(e) => e.kind(),
            SonarisError::Scheduler(e) => e.kind(),
            SonarisError::Io(_) | SonarisError::Store(_) => ErrorKind::Io,
            SonarisError::Config(_)
            | SonarisError::Definition(_)
            | SonarisError::IdentityMismatch { .. }
            | SonarisError::Task(_)
            | SonarisError::ShuttingDown => ErrorKind::ValidationFailure,
        }
    }

    /// True when the error means "no such job or endpoint".
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
