use parking_lot::Mutex;
use sonaris_core::{Job, JobId, ScheduleEntry};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{JobRecord, StateStore, StoreError};

const EXTENSION: &str = "json";

/// One pretty-printed JSON file per job, `<job id>.json`.
///
/// Writes go to `<job id>.json.tmp` and are renamed into place, so a record is
/// either the old or the new version, never a torn write.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened JSON job store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.{EXTENSION}"))
    }

    fn read_record(path: &Path) -> Result<Option<JobRecord>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl StateStore for JsonFileStore {
    fn commit(&self, job: &Job, entry: Option<&ScheduleEntry>) -> Result<(), StoreError> {
        let record = JobRecord {
            job: job.clone(),
            entry: entry.cloned(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let path = self.path_for(&job.id);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));

        let _guard = self.write_lock.lock();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Self::read_record(&self.path_for(id))
    }

    fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_record(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                // one bad file must not keep every other job from loading
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        records.sort_by_key(|record| record.job.seq);
        Ok(records)
    }
}
