//! Durable job state.
//!
//! A [`JobRecord`] is the unit of persistence: the job together with its
//! schedule entry, keyed by job id. [`StateStore::commit`] writes both in one
//! operation so a crash can never leave a job state and its schedule entry out
//! of step.

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use sonaris_core::{Job, JobId, JobState, ScheduleEntry};
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// A job and its (optional) schedule entry, persisted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job.
    pub job: Job,
    /// Its schedule entry; absent for terminal jobs.
    #[serde(default)]
    pub entry: Option<ScheduleEntry>,
}

/// Key-value persistence of job records.
pub trait StateStore: Send + Sync + Debug {
    /// Write the job and its schedule entry as one unit.
    fn commit(&self, job: &Job, entry: Option<&ScheduleEntry>) -> Result<(), StoreError>;

    /// Load one record.
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, id: &JobId) -> Result<bool, StoreError>;

    /// Every record, ordered by submission sequence.
    fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Write the job, keeping whatever schedule entry is stored for it.
    fn put(&self, job: &Job) -> Result<(), StoreError> {
        let entry = self.get(&job.id)?.and_then(|record| record.entry);
        self.commit(job, entry.as_ref())
    }

    /// Jobs currently in `state`, ordered by submission sequence.
    fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .map(|record| record.job)
            .filter(|job| job.state == state)
            .collect())
    }
}
