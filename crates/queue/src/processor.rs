//! Consumer loop: repeatedly dispatch jobs until stopped or the runtime
//! window elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::service::WorkerService;

/// Cooperative stop flag shared between a loop and whoever stops it
/// (typically a Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any sleeping loop.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early on stop. Returns whether a stop
    /// was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_stopped()
    }
}

/// Job processor configuration.
#[derive(Debug, Clone)]
pub struct JobProcessorConfig {
    /// Maximum time the loop runs before returning (process recycling).
    pub runtime: Duration,
    /// Sleep between polls when no job was available.
    pub idle_sleep: Duration,
    /// First backoff after a transport error; doubles on each failure.
    pub error_backoff: Duration,
    pub max_backoff: Duration,
    /// Return as soon as one poll finds no work.
    pub exit_when_idle: bool,
}

impl Default for JobProcessorConfig {
    fn default() -> Self {
        Self {
            runtime: Duration::from_secs(3600),
            idle_sleep: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            exit_when_idle: false,
        }
    }
}

impl JobProcessorConfig {
    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn with_error_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.error_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn exit_when_idle(mut self) -> Self {
        self.exit_when_idle = true;
        self
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Stopped,
    RuntimeElapsed,
    Idle,
}

/// Counters collected over one `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub processed: u64,
    pub idle_polls: u64,
    pub errors: u64,
    pub exit: ExitReason,
}

/// The dispatch loop run by each consumer process.
#[derive(Debug, Clone, Default)]
pub struct JobProcessor {
    config: JobProcessorConfig,
}

impl JobProcessor {
    pub fn new(config: JobProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobProcessorConfig {
        &self.config
    }

    /// Dispatch jobs until `stop` fires or the runtime window elapses.
    ///
    /// Stop is checked between jobs only; a running job is never preempted.
    pub fn run(&self, service: &WorkerService, stop: &StopSignal) -> ProcessSummary {
        let started = Instant::now();
        let mut processed = 0;
        let mut idle_polls = 0;
        let mut errors = 0;
        let mut backoff = self.config.error_backoff;

        info!(
            runtime_secs = self.config.runtime.as_secs(),
            workers = ?service.queue().workers(),
            "job processor started"
        );

        let exit = loop {
            if stop.is_stopped() {
                break ExitReason::Stopped;
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.runtime {
                break ExitReason::RuntimeElapsed;
            }
            let remaining = self.config.runtime - elapsed;

            match service.process_job_queue() {
                Ok(true) => {
                    processed += 1;
                    backoff = self.config.error_backoff;
                }
                Ok(false) => {
                    idle_polls += 1;
                    if self.config.exit_when_idle {
                        break ExitReason::Idle;
                    }
                    stop.wait_timeout(self.config.idle_sleep.min(remaining));
                }
                Err(e) => {
                    errors += 1;
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "dispatch failed");
                    stop.wait_timeout(backoff.min(remaining));
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        };

        let summary = ProcessSummary {
            processed,
            idle_polls,
            errors,
            exit,
        };
        info!(
            processed,
            idle_polls,
            errors,
            exit = ?exit,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job processor finished"
        );
        debug!(summary = ?summary, "processor summary");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryQueue;
    use crate::queue::{JobHandle, Queue, QueueError};
    use crate::registry::WorkerRegistry;
    use serde_json::Value;
    use std::thread;
    use workerman_core::{FnWorker, Job, Worker, Workload};

    fn service(queue: Arc<dyn Queue>) -> WorkerService {
        let mut registry = WorkerRegistry::new();
        registry.register_instance(
            "Noop",
            Arc::new(FnWorker::new(|_job: &Job| Ok(Value::Null))),
        );
        WorkerService::new(queue, registry)
    }

    #[test]
    fn drains_queue_then_exits_when_idle() {
        let queue = Arc::new(InMemoryQueue::new());
        for _ in 0..3 {
            queue.do_work_background("Noop", Workload::new()).unwrap();
        }
        let service = service(queue.clone());

        let processor = JobProcessor::new(JobProcessorConfig::default().exit_when_idle());
        let summary = processor.run(&service, &StopSignal::new());

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.idle_polls, 1);
        assert_eq!(summary.exit, ExitReason::Idle);
        assert!(queue.is_empty());
    }

    #[test]
    fn stopped_before_start_processes_nothing() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.do_work_background("Noop", Workload::new()).unwrap();
        let service = service(queue.clone());

        let stop = StopSignal::new();
        stop.stop();
        let summary = JobProcessor::default().run(&service, &stop);

        assert_eq!(summary.processed, 0);
        assert_eq!(summary.exit, ExitReason::Stopped);
        assert_eq!(queue.pending_count("Noop"), 1);
    }

    #[test]
    fn runtime_window_ends_the_loop() {
        let service = service(Arc::new(InMemoryQueue::new()));
        let config = JobProcessorConfig::default()
            .with_runtime(Duration::from_millis(50))
            .with_idle_sleep(Duration::from_millis(10));

        let started = Instant::now();
        let summary = JobProcessor::new(config).run(&service, &StopSignal::new());

        assert_eq!(summary.exit, ExitReason::RuntimeElapsed);
        assert!(summary.idle_polls >= 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_wakes_an_idle_loop() {
        let service = Arc::new(service(Arc::new(InMemoryQueue::new())));
        let stop = StopSignal::new();
        let config = JobProcessorConfig::default().with_idle_sleep(Duration::from_secs(30));

        let handle = {
            let service = service.clone();
            let stop = stop.clone();
            thread::spawn(move || JobProcessor::new(config).run(&service, &stop))
        };

        thread::sleep(Duration::from_millis(50));
        let asked = Instant::now();
        stop.stop();
        let summary = handle.join().unwrap();

        assert_eq!(summary.exit, ExitReason::Stopped);
        assert!(asked.elapsed() < Duration::from_secs(5));
    }

    struct BrokenQueue;

    impl Queue for BrokenQueue {
        fn do_work(&self, worker_name: &str, _workload: Workload) -> Result<Value, QueueError> {
            Err(QueueError::WorkerUnavailable(worker_name.to_string()))
        }

        fn do_work_background(
            &self,
            _worker_name: &str,
            _workload: Workload,
        ) -> Result<JobHandle, QueueError> {
            Err(QueueError::Enqueue("broker down".to_string()))
        }

        fn add_worker(&self, _worker_name: &str, _worker: Arc<dyn Worker>) -> Result<(), QueueError> {
            Ok(())
        }

        fn workers(&self) -> Vec<String> {
            Vec::new()
        }

        fn dispatch_jobs(&self) -> Result<bool, QueueError> {
            Err(QueueError::Transport("broker down".to_string()))
        }

        fn clear_worker_queue(&self, _worker_name: &str) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[test]
    fn transport_errors_back_off_and_continue() {
        let service = service(Arc::new(BrokenQueue));
        let config = JobProcessorConfig::default()
            .with_runtime(Duration::from_millis(100))
            .with_error_backoff(Duration::from_millis(5), Duration::from_millis(20));

        let summary = JobProcessor::new(config).run(&service, &StopSignal::new());

        assert!(summary.errors >= 2);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.exit, ExitReason::RuntimeElapsed);
    }

    #[test]
    fn wait_timeout_reports_stop() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(5)));
        stop.stop();
        assert!(stop.wait_timeout(Duration::from_secs(10)));
    }
}
