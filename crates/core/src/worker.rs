//! The worker capability.

use std::sync::Arc;

use serde_json::Value;

use crate::error::WorkerResult;
use crate::job::Job;

/// Something that can execute a [`Job`].
///
/// Workers receive their collaborators through their constructor; the job
/// only carries the serialized workload. Implementations must be safe to call
/// from any dispatch thread.
pub trait Worker: Send + Sync {
    fn execute(&self, job: &Job) -> WorkerResult<Value>;
}

impl<W> Worker for Arc<W>
where
    W: Worker + ?Sized,
{
    fn execute(&self, job: &Job) -> WorkerResult<Value> {
        (**self).execute(job)
    }
}

impl<W> Worker for Box<W>
where
    W: Worker + ?Sized,
{
    fn execute(&self, job: &Job) -> WorkerResult<Value> {
        (**self).execute(job)
    }
}

/// Adapter turning a closure into a [`Worker`].
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F>
where
    F: Fn(&Job) -> WorkerResult<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> core::fmt::Debug for FnWorker<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FnWorker(<closure>)")
    }
}

impl<F> Worker for FnWorker<F>
where
    F: Fn(&Job) -> WorkerResult<Value> + Send + Sync,
{
    fn execute(&self, job: &Job) -> WorkerResult<Value> {
        (self.f)(job)
    }
}
