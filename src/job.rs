use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Status of a conversion job.
///
/// Mutated only through [`StateMachine`](crate::state_machine::StateMachine)
/// transitions; see the transition table there for what is legal from where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states admit no further transition except `Failed -> Pending`
    /// via retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Dispatch priority, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Base score weight; lower scores are served first.
    pub fn weight(&self) -> f64 {
        match self {
            Priority::High => 0.0,
            Priority::Medium => 50.0,
            Priority::Low => 100.0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A unit of conversion work tracked by the scheduling core.
///
/// Holds status, priority, and timing metadata. The actual file payload and
/// the conversion routine live outside this crate; the job record references
/// them only by format names and size.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source_format: String,
    pub target_format: String,
    pub file_size: u64,
    pub status: JobStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time: Option<Duration>,
    pub retry_count: u32,
    /// Dependency edge to another job, resolved by id lookup only.
    pub parent_job_id: Option<Uuid>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(owner_id: Uuid, source_format: &str, target_format: &str, file_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            source_format: source_format.to_string(),
            target_format: target_format.to_string(),
            file_size,
            status: JobStatus::Pending,
            priority: Priority::Medium,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time: None,
            retry_count: 0,
            parent_job_id: None,
            error_message: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_job_id: Uuid) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }

    /// Override the creation timestamp, e.g. when rebuilding a record.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
