use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::{ConveyorError, Result};
use crate::job::{Job, JobStatus};
use crate::store::JobStore;

/// The single authority for status transitions of a job.
///
/// Every mutation of `Job::status` goes through here. Commits use the store's
/// conditional write keyed on the status that was read, so two callers racing
/// on the same job cannot both win: the loser observes `TaskState`.
pub struct StateMachine {
    store: Arc<dyn JobStore>,
    timeouts: TimeoutConfig,
}

impl StateMachine {
    pub fn new(store: Arc<dyn JobStore>, timeouts: TimeoutConfig) -> Self {
        Self { store, timeouts }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Legal targets from a given status. `Failed -> Pending` is reachable
    /// only through [`retry`](Self::retry).
    fn allowed(from: JobStatus) -> &'static [JobStatus] {
        match from {
            JobStatus::Pending => &[
                JobStatus::Processing,
                JobStatus::Cancelled,
                JobStatus::Failed,
            ],
            JobStatus::Processing => &[JobStatus::Completed, JobStatus::Failed],
            JobStatus::Completed => &[JobStatus::Failed],
            JobStatus::Failed => &[JobStatus::Pending],
            JobStatus::Cancelled => &[],
        }
    }

    /// Transition a job to `new_status`, stamping timestamps as it goes.
    pub fn transition_to(&self, job_id: Uuid, new_status: JobStatus) -> Result<Job> {
        let job = self.store.get(job_id)?;
        self.commit(job, new_status)
    }

    /// Retry a failed job: bump `retry_count` and move it back to `pending`.
    pub fn retry(&self, job_id: Uuid) -> Result<Job> {
        let mut job = self.store.get(job_id)?;
        if job.status != JobStatus::Failed {
            return Err(ConveyorError::TaskState(format!(
                "only failed jobs can be retried, job {} is {}",
                job.id, job.status
            )));
        }
        if job.retry_count >= self.timeouts.max_retries {
            return Err(ConveyorError::TaskState(format!(
                "maximum retry attempts ({}) exceeded for job {}",
                self.timeouts.max_retries, job.id
            )));
        }
        job.retry_count += 1;
        job.error_message = None;
        self.commit(job, JobStatus::Pending)
    }

    /// Cancel a job that has not yet finished. Marks intent only; in-flight
    /// work is expected to check status cooperatively.
    pub fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.get(job_id)?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return Err(ConveyorError::TaskState(format!(
                "cannot cancel job {} in {} state",
                job.id, job.status
            )));
        }
        self.commit(job, JobStatus::Cancelled)
    }

    /// Fail a job with an error message attached.
    pub fn fail(&self, job_id: Uuid, message: &str) -> Result<Job> {
        let mut job = self.store.get(job_id)?;
        job.error_message = Some(message.to_string());
        self.commit(job, JobStatus::Failed)
    }

    /// Whether the job has overstayed its current state. Terminal states
    /// never time out.
    pub fn is_timed_out(&self, job: &Job) -> bool {
        let now = Utc::now();
        match job.status {
            JobStatus::Processing => match job.started_at {
                Some(started) => now - started > self.timeouts.processing,
                // No started_at on a processing job; fall back to creation.
                None => now - job.created_at > self.timeouts.processing,
            },
            JobStatus::Pending => now - job.created_at > self.timeouts.pending,
            _ => false,
        }
    }

    /// Fail a timed-out job with a descriptive message. No-op (returns
    /// `Ok(None)`) when the job has not actually timed out.
    pub fn handle_timeout(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = self.store.get(job_id)?;
        if !self.is_timed_out(&job) {
            return Ok(None);
        }
        let message = format!("timeout: job exceeded the {} state limit", job.status);
        let failed = self.fail(job.id, &message)?;
        tracing::warn!(job_id = %job.id, state = %failed.status, "Job timed out");
        Ok(Some(failed))
    }

    fn commit(&self, mut job: Job, new_status: JobStatus) -> Result<Job> {
        let from = job.status;
        if !Self::allowed(from).contains(&new_status) {
            return Err(ConveyorError::TaskState(format!(
                "invalid state transition from {} to {} for job {}",
                from, new_status, job.id
            )));
        }

        job.status = new_status;
        let now = Utc::now();
        match new_status {
            JobStatus::Processing => job.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(now);
                if let Some(started) = job.started_at {
                    job.processing_time = Some(now - started);
                }
            }
            JobStatus::Pending => {}
        }

        self.store.update_if_status(&job, from)?;
        tracing::debug!(job_id = %job.id, from = %from, to = %new_status, "State transition");
        Ok(job)
    }
}
