use parking_lot::RwLock;
use sonaris_core::{Job, JobId, ScheduleEntry};
use std::collections::HashMap;

use super::{JobRecord, StateStore, StoreError};

/// Volatile store, for tests and deployments that do not need restart recovery.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn commit(&self, job: &Job, entry: Option<&ScheduleEntry>) -> Result<(), StoreError> {
        self.records.write().insert(
            job.id,
            JobRecord {
                job: job.clone(),
                entry: entry.cloned(),
            },
        );
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|record| record.job.seq);
        Ok(records)
    }
}
