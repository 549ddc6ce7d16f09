//! Workers this binary can run.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;
use workerman_core::{Job, Worker, WorkerResult};
use workerman_queue::WorkerRegistry;

/// Smoke-test worker: reverses `mystring`.
pub const TEST_WORKER: &str = "Test";

#[derive(Debug, Default)]
pub struct ReverseWorker {
    last: Mutex<Option<String>>,
}

impl ReverseWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result of the most recent job.
    pub fn last_result(&self) -> Option<String> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Worker for ReverseWorker {
    fn execute(&self, job: &Job) -> WorkerResult<Value> {
        let input = job.workload().require_str("mystring")?;
        let total = input.chars().count() as u64;
        job.report_progress(0, total);

        let reversed: String = input.chars().rev().collect();
        job.report_progress(total, total);
        debug!(input, reversed = %reversed, "reversed");

        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(reversed.clone());
        Ok(Value::String(reversed))
    }
}

/// Registry of every worker shipped with the binary.
pub fn default_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_instance(TEST_WORKER, Arc::new(ReverseWorker::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use workerman_core::{Progress, WorkerError, Workload};

    #[test]
    fn reverses_mystring() {
        let worker = ReverseWorker::new();
        let job = Job::new(TEST_WORKER, Workload::new().with("mystring", "dispatch"));

        assert_eq!(worker.execute(&job).unwrap(), Value::String("hctapsid".into()));
        assert_eq!(worker.last_result().as_deref(), Some("hctapsid"));
        assert_eq!(job.progress(), Some(Progress::new(8, 8)));
    }

    #[test]
    fn missing_key_is_invalid_argument() {
        let worker = ReverseWorker::new();
        let job = Job::new(TEST_WORKER, Workload::new());

        assert!(matches!(worker.execute(&job), Err(WorkerError::InvalidArgument(_))));
        assert!(worker.last_result().is_none());
        assert_eq!(job.progress(), None);
    }

    #[test]
    fn registry_knows_the_test_worker() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec![TEST_WORKER.to_string()]);
        assert!(registry.resolve(TEST_WORKER).is_ok());
    }
}
