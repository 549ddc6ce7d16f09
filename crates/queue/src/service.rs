//! Producer/consumer facade over a [`Queue`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info};

use workerman_core::{AccountId, ScheduledJobId, Worker, Workload};

use crate::queue::{JobHandle, Queue, QueueError};
use crate::registry::WorkerRegistry;

/// Error type returned by a [`WorkScheduler`].
pub type ScheduleError = Box<dyn std::error::Error + Send + Sync>;

/// Deferred-work sink, implemented by the scheduler service.
pub trait WorkScheduler: Send + Sync {
    fn schedule_work(
        &self,
        account_id: AccountId,
        worker_name: &str,
        workload: Workload,
        execute_time: DateTime<Utc>,
    ) -> Result<ScheduledJobId, ScheduleError>;
}

impl<S> WorkScheduler for Arc<S>
where
    S: WorkScheduler + ?Sized,
{
    fn schedule_work(
        &self,
        account_id: AccountId,
        worker_name: &str,
        workload: Workload,
        execute_time: DateTime<Utc>,
    ) -> Result<ScheduledJobId, ScheduleError> {
        (**self).schedule_work(account_id, worker_name, workload, execute_time)
    }
}

/// Entry point for producers and for the consumer loop.
///
/// Workers come from an explicit [`WorkerRegistry`]; they are added to the
/// queue on first use or all at once by [`WorkerService::register_workers`].
pub struct WorkerService {
    queue: Arc<dyn Queue>,
    registry: WorkerRegistry,
    scheduler: Option<Arc<dyn WorkScheduler>>,
    registered: Mutex<HashSet<String>>,
    all_registered: Mutex<bool>,
}

impl WorkerService {
    pub fn new(queue: Arc<dyn Queue>, registry: WorkerRegistry) -> Self {
        Self {
            queue,
            registry,
            scheduler: None,
            registered: Mutex::new(HashSet::new()),
            all_registered: Mutex::new(false),
        }
    }

    /// Attach the scheduler used by `schedule_work` / `do_work_delayed`.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn WorkScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn has_scheduler(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Run a job and wait for its result.
    pub fn do_work(&self, worker_name: &str, workload: Workload) -> Result<Value, QueueError> {
        self.ensure_local(worker_name)?;
        self.queue.do_work(worker_name, workload)
    }

    /// Enqueue a job and return its handle.
    pub fn do_work_background(
        &self,
        worker_name: &str,
        workload: Workload,
    ) -> Result<JobHandle, QueueError> {
        self.ensure_local(worker_name)?;
        let handle = self.queue.do_work_background(worker_name, workload)?;
        debug!(worker = %worker_name, handle = %handle, "background job submitted");
        Ok(handle)
    }

    /// Register a worker that is not part of the registry (e.g. one that
    /// needs a handle back to this service).
    pub fn add_worker(&self, worker_name: &str, worker: Arc<dyn Worker>) -> Result<(), QueueError> {
        self.queue.add_worker(worker_name, worker)?;
        self.mark_registered(worker_name);
        Ok(())
    }

    /// Add every registry entry to the queue. Runs once; later calls are no-ops.
    pub fn register_workers(&self) -> Result<usize, QueueError> {
        let mut all = self.all_registered.lock().unwrap_or_else(|e| e.into_inner());
        if *all {
            return Ok(0);
        }

        let mut added = 0;
        for name in self.registry.names() {
            if self.is_registered(&name) {
                continue;
            }
            let worker = self.registry.resolve(&name)?;
            self.queue.add_worker(&name, worker)?;
            self.mark_registered(&name);
            added += 1;
        }

        *all = true;
        info!(added, workers = ?self.queue.workers(), "workers registered");
        Ok(added)
    }

    /// Dispatch at most one job. Returns whether a job ran.
    pub fn process_job_queue(&self) -> Result<bool, QueueError> {
        self.register_workers()?;
        self.queue.dispatch_jobs()
    }

    pub fn clear_worker_queue(&self, worker_name: &str) -> Result<usize, QueueError> {
        self.queue.clear_worker_queue(worker_name)
    }

    /// Defer a job until `start` through the attached scheduler.
    pub fn schedule_work(
        &self,
        account_id: AccountId,
        worker_name: &str,
        workload: Workload,
        start: DateTime<Utc>,
    ) -> Result<ScheduledJobId, QueueError> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or(QueueError::SchedulerUnavailable)?;

        let id = scheduler
            .schedule_work(account_id, worker_name, workload, start)
            .map_err(|e| QueueError::Schedule(e.to_string()))?;
        debug!(
            account_id = %account_id,
            worker = %worker_name,
            scheduled_job_id = %id,
            execute_time = %start,
            "work scheduled"
        );
        Ok(id)
    }

    /// Defer a job by `delay` from now.
    pub fn do_work_delayed(
        &self,
        account_id: AccountId,
        worker_name: &str,
        workload: Workload,
        delay: Duration,
    ) -> Result<ScheduledJobId, QueueError> {
        self.schedule_work(account_id, worker_name, workload, Utc::now() + delay)
    }

    fn ensure_local(&self, worker_name: &str) -> Result<(), QueueError> {
        if self.is_registered(worker_name) || !self.registry.contains(worker_name) {
            return Ok(());
        }
        let worker = self.registry.resolve(worker_name)?;
        self.queue.add_worker(worker_name, worker)?;
        self.mark_registered(worker_name);
        Ok(())
    }

    fn is_registered(&self, worker_name: &str) -> bool {
        let registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.contains(worker_name)
    }

    fn mark_registered(&self, worker_name: &str) {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.insert(worker_name.to_string());
    }
}

impl core::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerService")
            .field("registry", &self.registry)
            .field("workers", &self.queue.workers())
            .field("has_scheduler", &self.scheduler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use workerman_core::{FnWorker, Job, WorkerError};

    fn reverser() -> Arc<dyn Worker> {
        Arc::new(FnWorker::new(|job: &Job| {
            let s = job.workload().require_str("mystring")?;
            Ok(Value::String(s.chars().rev().collect()))
        }))
    }

    fn service_with_test_worker() -> (Arc<InMemoryQueue>, WorkerService) {
        let queue = Arc::new(InMemoryQueue::new());
        let mut registry = WorkerRegistry::new();
        registry.register("Test", reverser);
        let service = WorkerService::new(queue.clone(), registry);
        (queue, service)
    }

    #[test]
    fn do_work_resolves_registry_lazily() {
        let (queue, service) = service_with_test_worker();
        assert!(queue.workers().is_empty());

        let out = service
            .do_work("Test", Workload::new().with("mystring", "abc"))
            .unwrap();
        assert_eq!(out, Value::String("cba".into()));
        assert_eq!(queue.workers(), vec!["Test".to_string()]);
    }

    #[test]
    fn do_work_unknown_name_is_unavailable() {
        let (_queue, service) = service_with_test_worker();
        let err = service.do_work("Missing", Workload::new()).unwrap_err();
        assert!(matches!(err, QueueError::WorkerUnavailable(_)));
    }

    #[test]
    fn worker_failure_is_not_swallowed() {
        let (_queue, service) = service_with_test_worker();
        let err = service.do_work("Test", Workload::new()).unwrap_err();
        assert!(matches!(err, QueueError::Worker(WorkerError::InvalidArgument(_))));
    }

    #[test]
    fn process_job_queue_registers_once_and_dispatches() {
        let built = Arc::new(AtomicUsize::new(0));
        let built_clone = built.clone();
        let queue = Arc::new(InMemoryQueue::new());
        let mut registry = WorkerRegistry::new();
        registry.register("Test", move || {
            built_clone.fetch_add(1, Ordering::SeqCst);
            reverser()
        });
        let service = WorkerService::new(queue.clone(), registry);

        queue
            .do_work_background("Test", Workload::new().with("mystring", "x"))
            .unwrap();

        assert!(service.process_job_queue().unwrap());
        assert!(!service.process_job_queue().unwrap());
        assert_eq!(service.register_workers().unwrap(), 0);
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduling_without_scheduler_fails() {
        let (_queue, service) = service_with_test_worker();
        let err = service
            .do_work_delayed(AccountId::new(), "Test", Workload::new(), Duration::minutes(5))
            .unwrap_err();
        assert!(matches!(err, QueueError::SchedulerUnavailable));
    }

    struct RecordingScheduler {
        calls: Mutex<Vec<(AccountId, String, DateTime<Utc>)>>,
    }

    impl WorkScheduler for RecordingScheduler {
        fn schedule_work(
            &self,
            account_id: AccountId,
            worker_name: &str,
            _workload: Workload,
            execute_time: DateTime<Utc>,
        ) -> Result<ScheduledJobId, ScheduleError> {
            self.calls
                .lock()
                .unwrap()
                .push((account_id, worker_name.to_string(), execute_time));
            Ok(ScheduledJobId::new())
        }
    }

    #[test]
    fn do_work_delayed_offsets_from_now() {
        let scheduler = Arc::new(RecordingScheduler {
            calls: Mutex::new(Vec::new()),
        });
        let (_queue, service) = service_with_test_worker();
        let service = service.with_scheduler(scheduler.clone());

        let account = AccountId::new();
        let before = Utc::now();
        service
            .do_work_delayed(account, "Test", Workload::new(), Duration::hours(1))
            .unwrap();

        let calls = scheduler.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, account);
        assert_eq!(calls[0].1, "Test");
        assert!(calls[0].2 >= before + Duration::hours(1));
    }
}
