//! Queue transport abstraction (mechanics only).
//!
//! A [`Queue`] moves jobs from producers to workers. Two delivery styles are
//! offered:
//!
//! - **Synchronous** (`do_work`): the caller blocks until the worker returns.
//! - **Background** (`do_work_background`): the job is enqueued and an opaque
//!   [`JobHandle`] is returned immediately.
//!
//! Consumers register workers by name (`add_worker`) and pull work with
//! `dispatch_jobs`, which never blocks waiting for new jobs so a dispatch loop
//! can interleave other duties such as checking for a stop signal.
//!
//! ## Delivery guarantees
//!
//! At-least-once: a job may be delivered more than once (consumer crash
//! before acknowledgement), so workers should be idempotent. No ordering is
//! guaranteed across producers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use workerman_core::{Worker, WorkerError, Workload};

/// Opaque handle of an enqueued background job (diagnostics only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No worker is registered for the name (in-process for synchronous calls).
    #[error("no worker registered for `{0}`")]
    WorkerUnavailable(String),

    /// The transport refused the job (e.g. broker unreachable).
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    /// Broker or protocol failure while dispatching.
    #[error("transport error: {0}")]
    Transport(String),

    /// A synchronous call did not get a reply in time.
    #[error("timed out after {timeout:?} waiting for `{worker_name}`")]
    Timeout {
        worker_name: String,
        timeout: Duration,
    },

    /// The worker ran and failed (synchronous calls only).
    #[error(transparent)]
    Worker(WorkerError),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deferred work was requested but no scheduler is attached.
    #[error("no scheduler attached to the worker service")]
    SchedulerUnavailable,

    #[error("scheduling failed: {0}")]
    Schedule(String),
}

impl From<WorkerError> for QueueError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Unavailable(name) => QueueError::WorkerUnavailable(name),
            other => QueueError::Worker(other),
        }
    }
}

/// Transport-agnostic job queue.
///
/// Implementations must be `Send + Sync`: producers and the dispatch loop may
/// share one instance across threads. Implementations must not hold internal
/// locks while a worker runs, since workers are allowed to enqueue more work.
pub trait Queue: Send + Sync {
    /// Run a job and wait for its result.
    fn do_work(&self, worker_name: &str, workload: Workload) -> Result<Value, QueueError>;

    /// Enqueue a job and return immediately.
    fn do_work_background(&self, worker_name: &str, workload: Workload)
    -> Result<JobHandle, QueueError>;

    /// Register a worker under `worker_name`. The last registration wins.
    fn add_worker(&self, worker_name: &str, worker: Arc<dyn Worker>) -> Result<(), QueueError>;

    /// Names of the workers registered in this process.
    fn workers(&self) -> Vec<String>;

    /// Pop and execute at most one job for a locally registered worker.
    ///
    /// Returns `Ok(false)` when no job was available, `Ok(true)` when a job
    /// ran (whatever its outcome). Transport failures are `Err`.
    fn dispatch_jobs(&self) -> Result<bool, QueueError>;

    /// Discard every pending job for `worker_name` without executing it.
    fn clear_worker_queue(&self, worker_name: &str) -> Result<usize, QueueError>;
}

impl<Q> Queue for Arc<Q>
where
    Q: Queue + ?Sized,
{
    fn do_work(&self, worker_name: &str, workload: Workload) -> Result<Value, QueueError> {
        (**self).do_work(worker_name, workload)
    }

    fn do_work_background(
        &self,
        worker_name: &str,
        workload: Workload,
    ) -> Result<JobHandle, QueueError> {
        (**self).do_work_background(worker_name, workload)
    }

    fn add_worker(&self, worker_name: &str, worker: Arc<dyn Worker>) -> Result<(), QueueError> {
        (**self).add_worker(worker_name, worker)
    }

    fn workers(&self) -> Vec<String> {
        (**self).workers()
    }

    fn dispatch_jobs(&self) -> Result<bool, QueueError> {
        (**self).dispatch_jobs()
    }

    fn clear_worker_queue(&self, worker_name: &str) -> Result<usize, QueueError> {
        (**self).clear_worker_queue(worker_name)
    }
}

/// Table of locally registered workers, shared by the queue implementations.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, worker_name: &str, worker: Arc<dyn Worker>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(worker_name.to_string(), worker);
    }

    pub fn get(&self, worker_name: &str) -> Option<Arc<dyn Worker>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(worker_name).cloned()
    }

    pub fn contains(&self, worker_name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(worker_name)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.is_empty()
    }

    /// Registered names, sorted for stable iteration.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }
}

impl core::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Listeners").field("names", &self.names()).finish()
    }
}
