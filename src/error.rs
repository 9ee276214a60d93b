use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Queue capacity exceeded")]
    QueueFull,

    #[error("User task limit exceeded for owner {0}")]
    UserTaskLimit(Uuid),

    #[error("Parent job {parent_id} of job {job_id} is not completed")]
    TaskDependency { job_id: Uuid, parent_id: Uuid },

    #[error("Invalid state transition: {0}")]
    TaskState(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Enqueue denied by quota policy: {0}")]
    QuotaDenied(String),

    #[error("Job store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
