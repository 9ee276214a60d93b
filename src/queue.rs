use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{ConveyorError, Result};
use crate::job::{Job, JobStatus};
use crate::state_machine::StateMachine;
use crate::store::{JobStore, SnapshotStore};

/// Admission input from the external quota subsystem, consulted by producers
/// before `enqueue`. Denials land in the crate's error taxonomy as
/// `QuotaDenied`.
pub trait AdmissionPolicy: Send + Sync {
    fn can_enqueue(&self, owner_id: Uuid, file_size: u64) -> Result<()>;
}

/// Policy that admits everything; the default when no quota subsystem is
/// wired.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn can_enqueue(&self, _owner_id: Uuid, _file_size: u64) -> Result<()> {
        Ok(())
    }
}

/// One queued job: a score and an id, nothing else. The queue is
/// read-through and never holds a `Job`; authoritative state is re-fetched
/// from the store before any entry is acted on.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    score: f64,
    job_id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal scores break ties by job id so dequeue order is reproducible.
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// Wire form of the queue snapshot: `(score, id)` pairs. Ownership
/// membership is rebuilt from the store on restore.
#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    entries: Vec<(f64, Uuid)>,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    /// job id -> owner id. Gives O(1) membership, duplicate prevention, and
    /// per-owner counting.
    queued: HashMap<Uuid, Uuid>,
}

/// Admission-controlled, capacity-bounded priority queue over job ids.
///
/// Lower score dequeues first. The score anchors the aging bonus to the
/// job's creation time: `weight + hours(created_at - epoch)`. Measuring
/// "now - created_at" at any instant would shift every entry's score by the
/// same amount, so the anchored form encodes a one-priority-unit-per-hour
/// waiting credit as a static number. A long-waiting low-priority job
/// eventually outranks a fresh high one.
///
/// All mutating operations serialize on a single mutex. After every mutation
/// the `(score, id)` snapshot is written to the snapshot store so a restarted
/// process can rebuild ordering; the snapshot is a cache, never the source of
/// truth for job state.
pub struct TaskQueue {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    snapshots: Arc<dyn SnapshotStore>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            store,
            snapshots,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn score(job: &Job) -> f64 {
        let created_hours = job.created_at.timestamp() as f64 / 3600.0;
        job.priority.weight() + created_hours
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| ConveyorError::Store(e.to_string()))
    }

    /// Add a job to the queue.
    ///
    /// Fails with `QueueFull` at global capacity and `UserTaskLimit` when the
    /// owner is at their per-owner limit. Enqueueing an id that is already
    /// queued is a no-op.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        let mut state = self.lock()?;

        if state.queued.contains_key(&job.id) {
            tracing::debug!(job_id = %job.id, "Job already queued, ignoring");
            return Ok(());
        }
        if state.queued.len() >= self.config.max_size {
            return Err(ConveyorError::QueueFull);
        }
        let owner_tasks = state
            .queued
            .values()
            .filter(|owner| **owner == job.owner_id)
            .count();
        if owner_tasks >= self.config.max_user_tasks {
            return Err(ConveyorError::UserTaskLimit(job.owner_id));
        }

        let entry = QueueEntry {
            score: Self::score(job),
            job_id: job.id,
        };
        state.heap.push(Reverse(entry));
        state.queued.insert(job.id, job.owner_id);
        tracing::debug!(job_id = %job.id, score = entry.score, priority = %job.priority, "Job enqueued");

        self.persist_locked(&state);
        Ok(())
    }

    /// Pop the next dispatchable job, lowest score first.
    ///
    /// Entries whose job is gone or no longer `pending` are discarded
    /// silently. An entry whose parent job has not completed is put back and
    /// the call fails with `TaskDependency`: "not ready yet", for the caller
    /// to retry on a later cycle. Returns `Ok(None)` when nothing is
    /// eligible.
    pub fn dequeue(&self) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let mut dirty = false;

        loop {
            let Some(Reverse(entry)) = state.heap.pop() else {
                if dirty {
                    self.persist_locked(&state);
                }
                return Ok(None);
            };

            let job = match self.store.get(entry.job_id) {
                Ok(job) => job,
                Err(ConveyorError::JobNotFound(_)) => {
                    state.queued.remove(&entry.job_id);
                    dirty = true;
                    continue;
                }
                Err(e) => {
                    state.heap.push(Reverse(entry));
                    return Err(e);
                }
            };

            if job.status != JobStatus::Pending {
                tracing::debug!(job_id = %job.id, status = %job.status, "Discarding stale queue entry");
                state.queued.remove(&entry.job_id);
                dirty = true;
                continue;
            }

            if let Some(parent_id) = job.parent_job_id {
                let parent_completed = match self.store.get(parent_id) {
                    Ok(parent) => parent.status == JobStatus::Completed,
                    Err(ConveyorError::JobNotFound(_)) => false,
                    Err(e) => {
                        state.heap.push(Reverse(entry));
                        return Err(e);
                    }
                };
                if !parent_completed {
                    // Never removed until the check passed: the entry goes
                    // straight back so the dependency resolves on a later
                    // call.
                    state.heap.push(Reverse(entry));
                    if dirty {
                        self.persist_locked(&state);
                    }
                    return Err(ConveyorError::TaskDependency {
                        job_id: job.id,
                        parent_id,
                    });
                }
            }

            state.queued.remove(&entry.job_id);
            self.persist_locked(&state);
            return Ok(Some(job));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.queued.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep queued entries and fail any whose job has timed out in its
    /// current state. Returns the number of entries removed.
    pub fn cleanup_timeouts(&self, state_machine: &StateMachine) -> Result<usize> {
        let mut state = self.lock()?;
        let entries: Vec<QueueEntry> = state.heap.drain().map(|Reverse(e)| e).collect();
        let mut kept: Vec<QueueEntry> = Vec::with_capacity(entries.len());
        let mut removed = 0usize;

        for entry in entries {
            let job = match self.store.get(entry.job_id) {
                Ok(job) => job,
                Err(ConveyorError::JobNotFound(_)) => {
                    removed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "Skipping entry during timeout sweep");
                    kept.push(entry);
                    continue;
                }
            };

            if state_machine.is_timed_out(&job) {
                match state_machine.handle_timeout(job.id) {
                    Ok(_) => {
                        removed += 1;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to time out queued job");
                        kept.push(entry);
                    }
                }
            } else {
                kept.push(entry);
            }
        }

        state.queued.retain(|id, _| kept.iter().any(|e| e.job_id == *id));
        state.heap = kept.into_iter().map(Reverse).collect();
        self.persist_locked(&state);
        Ok(removed)
    }

    /// Rebuild the queue from the last persisted snapshot.
    ///
    /// Each referenced job is re-fetched from the store; entries whose job no
    /// longer exists are dropped. A missing or unreadable snapshot starts the
    /// queue empty.
    pub fn restore_state(&self) -> Result<()> {
        let bytes = match self.snapshots.get(&self.config.snapshot_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot store unavailable, starting with an empty queue");
                return Ok(());
            }
        };

        let snapshot: QueueSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Corrupt queue snapshot, starting with an empty queue");
                return Ok(());
            }
        };

        let mut state = self.lock()?;
        state.heap.clear();
        state.queued.clear();

        for (score, job_id) in snapshot.entries {
            match self.store.get(job_id) {
                Ok(job) => {
                    state.heap.push(Reverse(QueueEntry { score, job_id }));
                    state.queued.insert(job_id, job.owner_id);
                }
                Err(ConveyorError::JobNotFound(_)) => {
                    tracing::debug!(job_id = %job_id, "Dropping snapshot entry for missing job");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(restored = state.queued.len(), "Queue state restored from snapshot");
        Ok(())
    }

    /// Write the current `(score, id)` ordering to the snapshot store.
    /// Failures are logged and swallowed: the snapshot is an optimization,
    /// not the source of truth.
    fn persist_locked(&self, state: &QueueState) {
        let snapshot = QueueSnapshot {
            entries: state
                .heap
                .iter()
                .map(|Reverse(e)| (e.score, e.job_id))
                .collect(),
        };

        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode queue snapshot");
                return;
            }
        };
        if let Err(e) = self.snapshots.set(&self.config.snapshot_key, bytes, None) {
            tracing::warn!(error = %e, "Failed to persist queue snapshot");
        }
    }
}
