//! Per-tenant scheduler loop guarded by an advisory lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use workerman_core::AccountId;
use workerman_queue::StopSignal;

use crate::lock::{LockError, LockManager};
use crate::runner::ScheduleRunnerWorker;

/// Schedule loop configuration.
#[derive(Debug, Clone)]
pub struct ScheduleLoopConfig {
    /// Deployment version; part of the lock name so versions don't contend.
    pub version: String,
    pub tick: Duration,
    pub lock_ttl: Duration,
}

impl Default for ScheduleLoopConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            tick: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(120),
        }
    }
}

/// How a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LoopOutcome {
    /// Another instance holds the lock; nothing ran.
    LockHeld,
    Stopped { ticks: u64 },
    /// The lock expired or was taken over while running.
    LockLost { ticks: u64 },
}

/// Runs the schedule runner for one account every tick while holding
/// `workerman:schedule:<version>:<account_id>`.
pub struct ScheduleLoop {
    runner: Arc<ScheduleRunnerWorker>,
    locks: Arc<dyn LockManager>,
    config: ScheduleLoopConfig,
}

impl ScheduleLoop {
    pub fn new(
        runner: Arc<ScheduleRunnerWorker>,
        locks: Arc<dyn LockManager>,
        config: ScheduleLoopConfig,
    ) -> Self {
        Self {
            runner,
            locks,
            config,
        }
    }

    pub fn lock_name(&self, account_id: AccountId) -> String {
        format!("workerman:schedule:{}:{}", self.config.version, account_id)
    }

    pub fn run(&self, account_id: AccountId, stop: &StopSignal) -> Result<LoopOutcome, LockError> {
        let lock = self.lock_name(account_id);
        if !self.locks.acquire(&lock, self.config.lock_ttl)? {
            info!(lock = %lock, "another scheduler instance is running; exiting");
            return Ok(LoopOutcome::LockHeld);
        }
        info!(lock = %lock, account_id = %account_id, "scheduler started");

        let result = self.tick_until_stopped(account_id, &lock, stop);

        match &result {
            Ok(LoopOutcome::LockLost { .. }) => {}
            _ => {
                if let Err(e) = self.locks.release(&lock) {
                    warn!(lock = %lock, error = %e, "failed to release scheduler lock");
                }
            }
        }

        info!(lock = %lock, outcome = ?result, "scheduler exiting");
        result
    }

    fn tick_until_stopped(
        &self,
        account_id: AccountId,
        lock: &str,
        stop: &StopSignal,
    ) -> Result<LoopOutcome, LockError> {
        let mut ticks = 0;
        loop {
            if stop.is_stopped() {
                return Ok(LoopOutcome::Stopped { ticks });
            }

            if let Err(e) = self.runner.run_for_account(account_id, Utc::now()) {
                error!(account_id = %account_id, error = %e, "schedule runner pass failed");
            }
            ticks += 1;

            if !self.locks.extend(lock, self.config.lock_ttl)? {
                warn!(lock = %lock, "scheduler lock lost");
                return Ok(LoopOutcome::LockLost { ticks });
            }

            if stop.wait_timeout(self.config.tick) {
                return Ok(LoopOutcome::Stopped { ticks });
            }
        }
    }
}

impl core::fmt::Debug for ScheduleLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScheduleLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockManager;
    use crate::service::SchedulerService;
    use crate::store::InMemorySchedulerStore;
    use std::thread;
    use workerman_core::Workload;
    use workerman_queue::{InMemoryQueue, WorkerRegistry, WorkerService};

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        scheduler: Arc<SchedulerService>,
        locks: Arc<InMemoryLockManager>,
        schedule_loop: ScheduleLoop,
        _service: Arc<WorkerService>,
    }

    fn fixture(tick: Duration) -> Fixture {
        let queue = Arc::new(InMemoryQueue::new());
        let scheduler = Arc::new(SchedulerService::new(InMemorySchedulerStore::arc()));
        let service = Arc::new(WorkerService::new(queue.clone(), WorkerRegistry::new()));
        let runner = ScheduleRunnerWorker::install(&service, scheduler.clone()).unwrap();
        let locks = Arc::new(InMemoryLockManager::new());
        let config = ScheduleLoopConfig {
            version: "test".to_string(),
            tick,
            lock_ttl: Duration::from_secs(120),
        };
        let schedule_loop = ScheduleLoop::new(runner, locks.clone(), config);
        Fixture {
            queue,
            scheduler,
            locks,
            schedule_loop,
            _service: service,
        }
    }

    #[test]
    fn exits_when_lock_is_held() {
        let f = fixture(Duration::from_millis(10));
        let account = AccountId::new();
        let lock = f.schedule_loop.lock_name(account);
        assert!(f.locks.acquire(&lock, Duration::from_secs(60)).unwrap());

        let outcome = f.schedule_loop.run(account, &StopSignal::new()).unwrap();
        assert_eq!(outcome, LoopOutcome::LockHeld);
        assert!(f.locks.is_held(&lock));
    }

    #[test]
    fn forwards_due_jobs_and_releases_on_stop() {
        let f = fixture(Duration::from_secs(30));
        let account = AccountId::new();
        f.scheduler
            .schedule_at_time(account, "Test", Utc::now(), Workload::new())
            .unwrap();

        let stop = StopSignal::new();
        let outcome = thread::scope(|s| {
            let handle = s.spawn(|| f.schedule_loop.run(account, &stop));
            thread::sleep(Duration::from_millis(50));
            stop.stop();
            handle.join().unwrap()
        })
        .unwrap();

        assert_eq!(outcome, LoopOutcome::Stopped { ticks: 1 });
        assert_eq!(f.queue.pending_count("Test"), 1);
        assert!(!f.locks.is_held(&f.schedule_loop.lock_name(account)));
    }

    #[test]
    fn lock_name_includes_version_and_account() {
        let f = fixture(Duration::from_secs(1));
        let account = AccountId::new();
        assert_eq!(
            f.schedule_loop.lock_name(account),
            format!("workerman:schedule:test:{account}")
        );
    }

    struct ForgetfulLocks;

    impl LockManager for ForgetfulLocks {
        fn acquire(&self, _name: &str, _ttl: Duration) -> Result<bool, LockError> {
            Ok(true)
        }

        fn extend(&self, _name: &str, _ttl: Duration) -> Result<bool, LockError> {
            Ok(false)
        }

        fn release(&self, _name: &str) -> Result<(), LockError> {
            Ok(())
        }
    }

    #[test]
    fn losing_the_lock_ends_the_loop() {
        let f = fixture(Duration::from_secs(30));
        let schedule_loop = ScheduleLoop::new(
            f.schedule_loop.runner.clone(),
            Arc::new(ForgetfulLocks),
            f.schedule_loop.config.clone(),
        );

        let outcome = schedule_loop.run(AccountId::new(), &StopSignal::new()).unwrap();
        assert_eq!(outcome, LoopOutcome::LockLost { ticks: 1 });
    }
}
