use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use conveyor::{
    ExecutionHook, Job, JobStatus, JobStore, MemoryJobStore, MemorySnapshotStore, Priority, QueueConfig,
    Scheduler, SchedulerConfig, StateMachine, StaticProbe, TaskQueue, TimeoutConfig,
};

/// Hook that accepts the handoff and leaves the job in `processing`, as a
/// real executor would until the work finishes.
struct NoopHook;

impl ExecutionHook for NoopHook {
    fn start(&self, _job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Hook that simulates an executor: completes the job after a short delay,
/// reporting back through the state machine like the real one must.
struct CompletingHook {
    sm: Arc<StateMachine>,
    delay: Duration,
}

impl ExecutionHook for CompletingHook {
    fn start(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sm = self.sm.clone();
        let id = job.id;
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sm.transition_to(id, JobStatus::Completed);
        });
        Ok(())
    }
}

struct FailingHook;

impl ExecutionHook for FailingHook {
    fn start(&self, _job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("converter binary missing".into())
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    queue: Arc<TaskQueue>,
    sm: Arc<StateMachine>,
    scheduler: Scheduler,
}

fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks: max_concurrent,
        check_interval: Duration::from_millis(10),
        backpressure_delay: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

fn harness_with(
    make_hook: impl FnOnce(Arc<StateMachine>) -> Arc<dyn ExecutionHook>,
    probe: StaticProbe,
    config: SchedulerConfig,
) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(TaskQueue::new(
        QueueConfig::default(),
        store.clone(),
        Arc::new(MemorySnapshotStore::new()),
    ));
    let sm = Arc::new(StateMachine::new(store.clone(), TimeoutConfig::default()));
    let hook = make_hook(sm.clone());
    let scheduler = Scheduler::new(
        queue.clone(),
        store.clone(),
        StateMachine::new(store.clone(), TimeoutConfig::default()),
        hook,
        Arc::new(probe),
        config,
    );
    Harness {
        store,
        queue,
        sm,
        scheduler,
    }
}

fn enqueue_pending(h: &Harness, n: usize) -> Vec<Uuid> {
    (0..n)
        .map(|_| {
            let job = Job::new(Uuid::new_v4(), "pdf", "txt", 4096);
            h.store.insert(job.clone()).unwrap();
            h.queue.enqueue(&job).unwrap();
            job.id
        })
        .collect()
}

/// Poll until `pred` holds or the deadline passes.
async fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pred()
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let h = harness_with(|_| Arc::new(NoopHook), StaticProbe::default(), fast_config(2));

    assert!(!h.scheduler.is_running().await);
    h.scheduler.start().await;
    h.scheduler.start().await;
    assert!(h.scheduler.is_running().await);

    h.scheduler.stop().await;
    h.scheduler.stop().await;
    assert!(!h.scheduler.is_running().await);
}

#[tokio::test]
async fn dispatch_respects_the_concurrency_cap() {
    let h = harness_with(|_| Arc::new(NoopHook), StaticProbe::default(), fast_config(3));
    enqueue_pending(&h, 8);

    h.scheduler.start().await;
    assert!(
        wait_until(
            || h.store.processing_count().unwrap() == 3,
            Duration::from_secs(2)
        )
        .await
    );

    // More cycles pass; the cap must hold because nothing completes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.processing_count().unwrap(), 3);
    assert_eq!(h.queue.len(), 5);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn all_jobs_complete_without_exceeding_the_cap() {
    let h = harness_with(
        |sm| {
            Arc::new(CompletingHook {
                sm,
                delay: Duration::from_millis(20),
            })
        },
        StaticProbe::default(),
        fast_config(2),
    );
    let ids = enqueue_pending(&h, 6);

    h.scheduler.start().await;
    let all_done = wait_until(
        || {
            assert!(h.store.processing_count().unwrap() <= 2, "cap exceeded");
            ids.iter()
                .all(|id| h.store.get(*id).unwrap().status == JobStatus::Completed)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(all_done);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn hook_failure_marks_the_job_failed_and_loop_survives() {
    let h = harness_with(
        |_| Arc::new(FailingHook),
        StaticProbe::default(),
        fast_config(2),
    );
    let ids = enqueue_pending(&h, 2);

    h.scheduler.start().await;
    let failed = wait_until(
        || {
            ids.iter()
                .all(|id| h.store.get(*id).unwrap().status == JobStatus::Failed)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(failed);

    let job = h.store.get(ids[0]).unwrap();
    assert!(job
        .error_message
        .unwrap()
        .contains("converter binary missing"));

    // The loop is still alive after per-job failures.
    assert!(h.scheduler.is_running().await);
    h.scheduler.stop().await;
}

#[tokio::test]
async fn resource_pressure_suspends_dispatch() {
    let h = harness_with(
        |_| Arc::new(NoopHook),
        StaticProbe {
            cpu: 95.0,
            memory: 20.0,
        },
        fast_config(2),
    );
    let ids = enqueue_pending(&h, 1);

    h.scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Nothing dispatched while CPU is over the high-water mark.
    assert_eq!(h.store.get(ids[0]).unwrap().status, JobStatus::Pending);
    assert_eq!(h.queue.len(), 1);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn stuck_processing_jobs_are_recovered() {
    let h = harness_with(|_| Arc::new(NoopHook), StaticProbe::default(), fast_config(2));

    // A processing job from before a crash: in the store, in no queue.
    let mut stuck = Job::new(Uuid::new_v4(), "avi", "mp4", 1 << 24);
    stuck.status = JobStatus::Processing;
    stuck.started_at = Some(Utc::now() - chrono::Duration::hours(2));
    h.store.insert(stuck.clone()).unwrap();

    h.scheduler.start().await;
    let recovered = wait_until(
        || h.store.get(stuck.id).unwrap().status == JobStatus::Failed,
        Duration::from_secs(2),
    )
    .await;
    assert!(recovered);

    let failed = h.store.get(stuck.id).unwrap();
    assert!(failed.error_message.unwrap().contains("timeout"));
    assert!(failed.completed_at.is_some());

    h.scheduler.stop().await;
}

#[tokio::test]
async fn stuck_jobs_are_recovered_under_resource_pressure() {
    let h = harness_with(
        |_| Arc::new(NoopHook),
        StaticProbe {
            cpu: 95.0,
            memory: 20.0,
        },
        fast_config(2),
    );

    let mut stuck = Job::new(Uuid::new_v4(), "avi", "mp4", 1 << 24);
    stuck.status = JobStatus::Processing;
    stuck.started_at = Some(Utc::now() - chrono::Duration::hours(2));
    h.store.insert(stuck.clone()).unwrap();
    let ids = enqueue_pending(&h, 1);

    h.scheduler.start().await;

    // Backpressure suspends dispatch only; timed-out jobs still get failed.
    let recovered = wait_until(
        || h.store.get(stuck.id).unwrap().status == JobStatus::Failed,
        Duration::from_secs(2),
    )
    .await;
    assert!(recovered);
    assert!(h
        .store
        .get(stuck.id)
        .unwrap()
        .error_message
        .unwrap()
        .contains("timeout"));

    // The pending job is untouched while CPU stays over the high-water mark.
    assert_eq!(h.store.get(ids[0]).unwrap().status, JobStatus::Pending);
    assert_eq!(h.queue.len(), 1);

    h.scheduler.stop().await;
}

#[tokio::test]
async fn child_jobs_wait_for_their_parent() {
    let h = harness_with(
        |sm| {
            Arc::new(CompletingHook {
                sm,
                delay: Duration::from_millis(10),
            })
        },
        StaticProbe::default(),
        fast_config(2),
    );

    let parent = Job::new(Uuid::new_v4(), "doc", "pdf", 100);
    h.store.insert(parent.clone()).unwrap();
    let child = Job::new(parent.owner_id, "pdf", "png", 100)
        .with_priority(Priority::High)
        .with_parent(parent.id);
    h.store.insert(child.clone()).unwrap();
    h.queue.enqueue(&child).unwrap();

    h.scheduler.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Parent still pending, so the child was never dispatched.
    assert_eq!(h.store.get(child.id).unwrap().status, JobStatus::Pending);
    assert_eq!(h.queue.len(), 1);

    h.sm.transition_to(parent.id, JobStatus::Processing).unwrap();
    h.sm.transition_to(parent.id, JobStatus::Completed).unwrap();

    let done = wait_until(
        || h.store.get(child.id).unwrap().status == JobStatus::Completed,
        Duration::from_secs(2),
    )
    .await;
    assert!(done);

    h.scheduler.stop().await;
}
