use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ConveyorError, Result};
use crate::job::{Job, JobStatus};

/// Durable job storage, the single source of truth for job state.
///
/// Read and written concurrently by producers, the scheduler, and executors.
/// `update_if_status` is the conditional write that keeps racing transitions
/// from trampling each other: the loser of a race gets `TaskState` back
/// instead of silently overwriting.
pub trait JobStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Job>;

    fn insert(&self, job: Job) -> Result<()>;

    fn update(&self, job: &Job) -> Result<()>;

    /// Commit `job` only if the stored record's status still equals `expected`.
    fn update_if_status(&self, job: &Job, expected: JobStatus) -> Result<()>;

    /// Number of jobs currently in `processing`.
    fn processing_count(&self) -> Result<usize>;

    /// Jobs in `processing` whose `started_at` is older than `started_before`.
    /// Used by the scheduler's stuck-job recovery sweep.
    fn stuck_processing(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>>;
}

/// Ephemeral key-value storage for the queue-state snapshot.
///
/// A cache of ordering only, never authoritative for job state. Implementors
/// may drop data at any time; the queue rebuilds from the job store.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
}

/// In-memory job store backed by a `HashMap`.
///
/// Used by the test suites and by embedders that have not wired a real
/// database. Conditional updates take the write lock for the whole
/// check-and-set, which gives the same atomicity a database row lock would.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, id: Uuid) -> Result<Job> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        jobs.get(&id).cloned().ok_or(ConveyorError::JobNotFound(id))
    }

    fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        jobs.insert(job.id, job);
        Ok(())
    }

    fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        if !jobs.contains_key(&job.id) {
            return Err(ConveyorError::JobNotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn update_if_status(&self, job: &Job, expected: JobStatus) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        let current = jobs
            .get(&job.id)
            .ok_or(ConveyorError::JobNotFound(job.id))?;
        if current.status != expected {
            return Err(ConveyorError::TaskState(format!(
                "concurrent update: job {} is {} rather than {}",
                job.id, current.status, expected
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn processing_count(&self) -> Result<usize> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .count())
    }

    fn stuck_processing(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.map(|t| t < started_before).unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// In-memory snapshot store. TTLs are accepted and ignored; entries live as
/// long as the process.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| ConveyorError::Store(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
