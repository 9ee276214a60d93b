//! Job scheduling core for a file conversion service.
//!
//! An in-process library, invoked by a web layer that is out of scope here.
//! Three components:
//!
//! - [`StateMachine`](state_machine::StateMachine): the single authority for
//!   legal status transitions of a job, with per-state timeout handling.
//! - [`TaskQueue`](queue::TaskQueue): an admission-controlled, read-through
//!   priority queue over job ids, with aging and crash-safe ordering
//!   snapshots.
//! - [`Scheduler`](scheduler::Scheduler): the background loop that recovers
//!   stuck jobs every cycle and, resource pressure permitting, dispatches
//!   queued jobs to an external execution hook under a concurrency cap.
//!
//! The durable job store is the single source of truth; the queue never
//! caches job state and the snapshot store is an ordering cache only.

pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod state_machine;
pub mod store;

pub use config::{QueueConfig, SchedulerConfig, TimeoutConfig};
pub use error::{ConveyorError, Result};
pub use job::{Job, JobStatus, Priority};
pub use queue::{AdmissionPolicy, AllowAll, TaskQueue};
pub use scheduler::{ExecutionHook, ResourceProbe, Scheduler, StaticProbe};
pub use state_machine::StateMachine;
pub use store::{JobStore, MemoryJobStore, MemorySnapshotStore, SnapshotStore};
