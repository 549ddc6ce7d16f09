//! Worker that forwards due scheduled jobs to the queue.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use workerman_core::{AccountId, Job, Worker, WorkerError, WorkerResult, Workload};
use workerman_queue::{JobHandle, QueueError, WorkerService};

use crate::service::SchedulerService;

/// Registration name of [`ScheduleRunnerWorker`].
pub const SCHEDULE_RUNNER: &str = "ScheduleRunner";

#[derive(Debug, Deserialize)]
struct RunnerArgs {
    account_id: AccountId,
}

/// Outcome of one runner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Handles of the jobs handed to the queue.
    pub handles: Vec<JobHandle>,
    /// Items that could not be enqueued or marked executed.
    pub failed: usize,
}

/// Polls the scheduler for due jobs of one account and enqueues them.
///
/// A job is marked executed once the queue accepted it (handed off, not
/// finished). Failures are isolated per job: an item that cannot be
/// enqueued stays due and is retried on the next pass.
pub struct ScheduleRunnerWorker {
    service: Weak<WorkerService>,
    scheduler: Arc<SchedulerService>,
}

impl ScheduleRunnerWorker {
    /// The service is held weakly: the service's queue owns this worker.
    pub fn new(service: &Arc<WorkerService>, scheduler: Arc<SchedulerService>) -> Self {
        Self {
            service: Arc::downgrade(service),
            scheduler,
        }
    }

    /// Build the runner and register it on `service` as [`SCHEDULE_RUNNER`].
    pub fn install(
        service: &Arc<WorkerService>,
        scheduler: Arc<SchedulerService>,
    ) -> Result<Arc<Self>, QueueError> {
        let runner = Arc::new(Self::new(service, scheduler));
        service.add_worker(SCHEDULE_RUNNER, runner.clone())?;
        Ok(runner)
    }

    /// Workload that triggers a pass for `account_id`.
    pub fn workload(account_id: AccountId) -> Workload {
        let mut workload = Workload::new();
        workload.set_account_id(account_id);
        workload
    }

    /// Forward every job of `account_id` due by `now`.
    pub fn run_for_account(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> WorkerResult<RunReport> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| WorkerError::failed("worker service is gone"))?;

        let due = self
            .scheduler
            .get_scheduled_to_run(account_id, now, None)
            .map_err(|e| WorkerError::failed(format!("loading due jobs: {e}")))?;

        let mut report = RunReport::default();
        for job in due {
            let mut data = job.job_data.clone();
            data.set_account_id(account_id);

            let handle = match service.do_work_background(&job.worker_name, data) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        account_id = %account_id,
                        scheduled_job_id = ?job.id,
                        worker = %job.worker_name,
                        error = %e,
                        "failed to enqueue scheduled job"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.scheduler.set_job_as_executed(&job) {
                // Already enqueued; it will be enqueued again next pass.
                error!(
                    account_id = %account_id,
                    scheduled_job_id = ?job.id,
                    handle = %handle,
                    error = %e,
                    "failed to mark scheduled job executed"
                );
                report.failed += 1;
            }

            debug!(
                account_id = %account_id,
                scheduled_job_id = ?job.id,
                worker = %job.worker_name,
                handle = %handle,
                "scheduled job forwarded"
            );
            report.handles.push(handle);
        }

        if !report.handles.is_empty() || report.failed > 0 {
            info!(
                account_id = %account_id,
                forwarded = report.handles.len(),
                failed = report.failed,
                "schedule runner pass"
            );
        }
        Ok(report)
    }
}

impl Worker for ScheduleRunnerWorker {
    fn execute(&self, job: &Job) -> WorkerResult<Value> {
        let args: RunnerArgs = job.workload().decode()?;
        let report = self.run_for_account(args.account_id, Utc::now())?;
        serde_json::to_value(report).map_err(|e| WorkerError::failed(e.to_string()))
    }
}

impl core::fmt::Debug for ScheduleRunnerWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScheduleRunnerWorker").finish_non_exhaustive()
    }
}
