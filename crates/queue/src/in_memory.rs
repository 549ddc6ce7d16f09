//! In-memory queue for tests/dev and single-node deployments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use workerman_core::{Job, Progress, Worker, Workload};

use crate::queue::{JobHandle, Listeners, Queue, QueueError};

/// When background jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Jobs wait in the FIFO until `dispatch_jobs` picks them up.
    #[default]
    Deferred,
    /// Jobs run inline on `do_work_background` when a local worker exists.
    Immediate,
}

/// In-process FIFO queue.
///
/// - No IO
/// - Synchronous calls require a worker registered in this process
/// - The job lock is never held while a worker runs
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    mode: DeliveryMode,
    listeners: Listeners,
    jobs: Mutex<VecDeque<(JobHandle, Job)>>,
    /// Final progress of recently finished jobs, oldest first.
    progress: Mutex<VecDeque<(JobHandle, Progress)>>,
    seq: AtomicU64,
}

/// Finished jobs whose progress stays queryable.
const PROGRESS_HISTORY: usize = 1024;

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: DeliveryMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Number of jobs waiting for `worker_name`.
    pub fn pending_count(&self, worker_name: &str) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.iter().filter(|(_, job)| job.target() == worker_name).count()
    }

    /// Total number of waiting jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last progress reported by a finished background job.
    pub fn job_progress(&self, handle: &JobHandle) -> Option<Progress> {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress
            .iter()
            .rev()
            .find(|(h, _)| h == handle)
            .map(|(_, p)| *p)
    }

    fn run_logged(&self, handle: &JobHandle, job: &Job, worker: &dyn Worker) {
        let result = worker.execute(job);
        let progress = job.progress();
        match result {
            Ok(_) => debug!(handle = %handle, worker = %job.target(), ?progress, "job completed"),
            Err(e) => warn!(
                handle = %handle,
                worker = %job.target(),
                ?progress,
                error = %e,
                "job failed"
            ),
        }

        if let Some(progress) = progress {
            let mut history = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == PROGRESS_HISTORY {
                history.pop_front();
            }
            history.push_back((handle.clone(), progress));
        }
    }

    fn next_handle(&self) -> JobHandle {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        JobHandle::new(format!("mem-{seq}"))
    }

    /// Remove the first job addressed to a registered worker.
    fn take_runnable(&self) -> Option<(JobHandle, Job, Arc<dyn Worker>)> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let (position, worker) = jobs
            .iter()
            .enumerate()
            .find_map(|(i, (_, job))| self.listeners.get(job.target()).map(|w| (i, w)))?;
        let (handle, job) = jobs.remove(position)?;
        Some((handle, job, worker))
    }
}

impl Queue for InMemoryQueue {
    fn do_work(&self, worker_name: &str, workload: Workload) -> Result<Value, QueueError> {
        let worker = self
            .listeners
            .get(worker_name)
            .ok_or_else(|| QueueError::WorkerUnavailable(worker_name.to_string()))?;

        let job = Job::new(worker_name, workload);
        worker.execute(&job).map_err(QueueError::from)
    }

    fn do_work_background(
        &self,
        worker_name: &str,
        workload: Workload,
    ) -> Result<JobHandle, QueueError> {
        let handle = self.next_handle();
        let job = Job::new(worker_name, workload);

        if self.mode == DeliveryMode::Immediate {
            if let Some(worker) = self.listeners.get(worker_name) {
                self.run_logged(&handle, &job, worker.as_ref());
                return Ok(handle);
            }
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.push_back((handle.clone(), job));
        debug!(handle = %handle, worker = %worker_name, "job enqueued");
        Ok(handle)
    }

    fn add_worker(&self, worker_name: &str, worker: Arc<dyn Worker>) -> Result<(), QueueError> {
        self.listeners.insert(worker_name, worker);
        Ok(())
    }

    fn workers(&self) -> Vec<String> {
        self.listeners.names()
    }

    fn dispatch_jobs(&self) -> Result<bool, QueueError> {
        if self.listeners.is_empty() {
            return Ok(false);
        }

        let Some((handle, job, worker)) = self.take_runnable() else {
            return Ok(false);
        };

        self.run_logged(&handle, &job, worker.as_ref());
        Ok(true)
    }

    fn clear_worker_queue(&self, worker_name: &str) -> Result<usize, QueueError> {
        let purged = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let before = jobs.len();
            jobs.retain(|(_, job)| job.target() != worker_name);
            before - jobs.len()
        };
        debug!(worker = %worker_name, purged, "worker queue cleared");
        Ok(purged)
    }
}
