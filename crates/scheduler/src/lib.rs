//! Persisted scheduling of deferred and recurring work.
//!
//! - [`SchedulerService`]: one-shot and recurring jobs over a [`SchedulerStore`]
//! - [`ScheduleRunnerWorker`]: forwards due jobs to the queue
//! - [`ScheduleLoop`]: per-tenant singleton loop guarded by a [`LockManager`]

pub mod lock;
pub mod runner;
pub mod schedule_loop;
pub mod service;
pub mod store;
pub mod types;

pub use lock::{InMemoryLockManager, LockError, LockManager};
pub use runner::{RunReport, SCHEDULE_RUNNER, ScheduleRunnerWorker};
pub use schedule_loop::{LoopOutcome, ScheduleLoop, ScheduleLoopConfig};
pub use service::{MAX_OCCURRENCES_PER_HORIZON, SchedulerError, SchedulerService};
pub use store::{InMemorySchedulerStore, SchedulerStore, SchedulerStoreError};
pub use types::{IntervalUnit, JobState, RecurringJob, ScheduledJob, UnknownIntervalUnit};
