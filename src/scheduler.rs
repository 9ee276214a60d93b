use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::ConveyorError;
use crate::job::{Job, JobStatus};
use crate::queue::TaskQueue;
use crate::state_machine::StateMachine;
use crate::store::JobStore;

/// External execution hook: receives dispatched jobs.
///
/// `start` is a handoff, not a synchronous call: it must return promptly and
/// arrange for the work to happen elsewhere. The eventual outcome is reported
/// back exclusively through `StateMachine::transition_to` with `Completed` or
/// `Failed`.
pub trait ExecutionHook: Send + Sync {
    fn start(&self, job: &Job) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Live system resource readings, in percent.
pub trait ResourceProbe: Send + Sync {
    fn cpu_usage(&self) -> f64;
    fn memory_usage(&self) -> f64;
}

/// Probe returning fixed readings. Useful in tests and as a stand-in until a
/// real probe is wired by the embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub cpu: f64,
    pub memory: f64,
}

impl ResourceProbe for StaticProbe {
    fn cpu_usage(&self) -> f64 {
        self.cpu
    }

    fn memory_usage(&self) -> f64 {
        self.memory
    }
}

struct SchedulerCore {
    queue: Arc<TaskQueue>,
    store: Arc<dyn JobStore>,
    state_machine: StateMachine,
    hook: Arc<dyn ExecutionHook>,
    probe: Arc<dyn ResourceProbe>,
    config: SchedulerConfig,
}

/// The background control loop that turns queued jobs into running work.
///
/// An explicit value owning its worker task: construct one per embedding (or
/// per test) and inject the collaborators. `start`/`stop` are idempotent.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    worker: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        store: Arc<dyn JobStore>,
        state_machine: StateMachine,
        hook: Arc<dyn ExecutionHook>,
        probe: Arc<dyn ResourceProbe>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                queue,
                store,
                state_machine,
                hook,
                probe,
                config,
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the scheduling loop. Starting an already-running scheduler has
    /// no effect.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if let Some((_, handle)) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let token = CancellationToken::new();
        let core = self.core.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            run_loop(core, loop_token).await;
        });
        *worker = Some((token, handle));
        tracing::info!("Task scheduler started");
    }

    /// Cancel the loop and wait for it to drain. Stopping a stopped
    /// scheduler has no effect.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some((token, handle)) = worker.take() else {
            return;
        };
        token.cancel();
        let _ = handle.await;
        tracing::info!("Task scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }
}

async fn run_loop(core: Arc<SchedulerCore>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(core.config.check_interval) => {
                core.cycle().await;
            }
        }
    }
}

impl SchedulerCore {
    /// One scheduling cycle: stuck-job recovery, resource check, dispatch.
    /// Recovery runs unconditionally; resource pressure suspends dispatch
    /// only. Per-job errors are isolated; nothing in here terminates the
    /// loop.
    async fn cycle(&self) {
        self.recover_stuck_jobs();
        if !self.resources_ok() {
            tokio::time::sleep(self.config.backpressure_delay).await;
            return;
        }
        self.dispatch();
    }

    fn resources_ok(&self) -> bool {
        let cpu = self.probe.cpu_usage();
        let memory = self.probe.memory_usage();
        if cpu > self.config.cpu_high_water || memory > self.config.memory_high_water {
            tracing::warn!(cpu, memory, "System resources critical, backing off");
            return false;
        }
        true
    }

    /// Fail processing jobs whose `started_at` is older than the processing
    /// timeout. Runs every cycle, so recovery is self-healing even for jobs
    /// the queue never held (e.g. after a crash).
    fn recover_stuck_jobs(&self) {
        let cutoff = Utc::now() - self.state_machine.timeouts().processing;
        let stuck = match self.store.stuck_processing(cutoff) {
            Ok(stuck) => stuck,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query stuck jobs");
                return;
            }
        };

        for job in stuck {
            match self.state_machine.handle_timeout(job.id) {
                Ok(Some(_)) => {
                    tracing::warn!(job_id = %job.id, "Recovered stuck job");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Error recovering stuck job");
                }
            }
        }
    }

    fn dispatch(&self) {
        let processing = match self.store.processing_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to count processing jobs");
                return;
            }
        };
        let available_slots = self.config.max_concurrent_tasks.saturating_sub(processing);

        for _ in 0..available_slots {
            if !self.resources_ok() {
                break;
            }

            match self.queue.dequeue() {
                Ok(Some(job)) => self.start_job(job),
                Ok(None) => break,
                Err(ConveyorError::TaskDependency { job_id, parent_id }) => {
                    // Not ready yet; the entry went back into the queue.
                    tracing::debug!(job_id = %job_id, parent_id = %parent_id, "Job waiting on parent");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error dequeuing job");
                    break;
                }
            }
        }
    }

    /// Move a dequeued job into `processing` and hand it to the execution
    /// hook. Any failure marks the job failed with the error message; it
    /// never propagates out of the cycle.
    fn start_job(&self, job: Job) {
        let started = match self.state_machine.transition_to(job.id, JobStatus::Processing) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Error starting job");
                self.mark_failed(job.id, &e.to_string());
                return;
            }
        };

        if let Err(e) = self.hook.start(&started) {
            tracing::error!(job_id = %job.id, error = %e, "Execution hook rejected job");
            self.mark_failed(job.id, &e.to_string());
            return;
        }

        tracing::info!(job_id = %job.id, priority = %started.priority, "Started processing job");
    }

    fn mark_failed(&self, job_id: uuid::Uuid, message: &str) {
        if let Err(e) = self.state_machine.fail(job_id, message) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
        }
    }
}
