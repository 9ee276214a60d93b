use std::time::Duration;

/// Capacity and fairness limits for the task queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum total queued jobs.
    pub max_size: usize,
    /// Maximum queued jobs per owner.
    pub max_user_tasks: usize,
    /// Snapshot store key for queue-state persistence.
    pub snapshot_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_user_tasks: 10,
            snapshot_key: "task_queue_state".to_string(),
        }
    }
}

/// Per-state timeouts evaluated by the state machine.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long a job may sit in `processing`, measured from `started_at`.
    pub processing: chrono::Duration,
    /// How long a job may sit in `pending`, measured from `created_at`.
    pub pending: chrono::Duration,
    /// Maximum retry attempts for a failed job.
    pub max_retries: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            processing: chrono::Duration::hours(1),
            pending: chrono::Duration::hours(24),
            max_retries: 3,
        }
    }
}

/// Tuning knobs for the scheduler control loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrency cap on jobs in `processing`.
    pub max_concurrent_tasks: usize,
    /// Loop interval between scheduling cycles.
    pub check_interval: Duration,
    /// Sleep applied when CPU/memory are over the high-water mark.
    pub backpressure_delay: Duration,
    /// CPU utilization percentage above which dispatch is skipped.
    pub cpu_high_water: f64,
    /// Memory utilization percentage above which dispatch is skipped.
    pub memory_high_water: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            check_interval: Duration::from_secs(1),
            backpressure_delay: Duration::from_secs(5),
            cpu_high_water: 90.0,
            memory_high_water: 90.0,
        }
    }
}
