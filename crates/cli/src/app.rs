//! Wiring of config, transports and services behind each command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use workerman_core::{AccountId, Workload};
use workerman_infra::postgres::PostgresSchedulerStore;
use workerman_infra::redis::{RedisLockManager, RedisQueueConfig, RedisStreamsQueue};
use workerman_infra::{QueueBackend, WorkerManConfig};
use workerman_observability::LogFormat;
use workerman_queue::{
    InMemoryQueue, JobHandle, JobProcessor, JobProcessorConfig, ProcessSummary, Queue,
    StopSignal, WorkScheduler, WorkerRegistry, WorkerService,
};
use workerman_scheduler::{
    InMemoryLockManager, InMemorySchedulerStore, LockManager, LoopOutcome, ScheduleLoop,
    ScheduleLoopConfig, ScheduleRunnerWorker, SchedulerService, SchedulerStore,
};

use crate::args::{Cli, Command};
use crate::shutdown::stop_on_ctrl_c;
use crate::workers::default_registry;

const POSTGRES_POOL_SIZE: u32 = 5;

/// Config file, then environment, then command-line overrides.
pub fn load_config(cli: &Cli) -> Result<WorkerManConfig> {
    let mut config = WorkerManConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(backend) = cli.queue {
        config.queue.backend = backend;
    }
    Ok(config)
}

pub fn build_queue(config: &WorkerManConfig) -> Result<Arc<dyn Queue>> {
    match config.queue.backend {
        QueueBackend::Memory => Ok(Arc::new(InMemoryQueue::new())),
        QueueBackend::Redis => {
            let mut redis_config = RedisQueueConfig {
                stream_prefix: config.redis.stream_prefix.clone(),
                rpc_timeout: Duration::from_secs(config.redis.rpc_timeout_secs),
                pending_timeout: Duration::from_millis(config.redis.pending_timeout_ms),
                max_deliveries: config.redis.max_deliveries,
                ..RedisQueueConfig::default()
            };
            if let Some(consumer) = &config.redis.consumer_name {
                redis_config.consumer_name = consumer.clone();
            }
            let queue = RedisStreamsQueue::new(&config.redis.url, redis_config)
                .context("connecting to redis")?;
            Ok(Arc::new(queue))
        }
    }
}

pub fn build_scheduler_store(config: &WorkerManConfig) -> Result<Arc<dyn SchedulerStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PostgresSchedulerStore::connect(url, POSTGRES_POOL_SIZE)
                .context("connecting to postgres")?;
            store.migrate().context("applying scheduler schema")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("no database configured; scheduled jobs are kept in memory");
            Ok(InMemorySchedulerStore::arc())
        }
    }
}

pub fn build_lock_manager(config: &WorkerManConfig) -> Result<Arc<dyn LockManager>> {
    match config.queue.backend {
        QueueBackend::Memory => Ok(Arc::new(InMemoryLockManager::new())),
        QueueBackend::Redis => {
            let locks = RedisLockManager::new(&config.redis.url).context("connecting to redis")?;
            Ok(Arc::new(locks))
        }
    }
}

/// Services shared by all commands.
pub struct App {
    config: WorkerManConfig,
    service: Arc<WorkerService>,
    scheduler: Arc<SchedulerService>,
    runner: Arc<ScheduleRunnerWorker>,
}

impl App {
    pub fn build(config: WorkerManConfig, registry: WorkerRegistry) -> Result<Self> {
        let queue = build_queue(&config)?;
        let scheduler = Arc::new(SchedulerService::new(build_scheduler_store(&config)?));
        Self::assemble(config, queue, registry, scheduler)
    }

    /// Wire already-built parts together.
    pub fn assemble(
        config: WorkerManConfig,
        queue: Arc<dyn Queue>,
        registry: WorkerRegistry,
        scheduler: Arc<SchedulerService>,
    ) -> Result<Self> {
        let work_scheduler: Arc<dyn WorkScheduler> = scheduler.clone();
        let service = Arc::new(WorkerService::new(queue, registry).with_scheduler(work_scheduler));
        let runner = ScheduleRunnerWorker::install(&service, scheduler.clone())
            .context("registering the schedule runner")?;

        Ok(Self {
            config,
            service,
            scheduler,
            runner,
        })
    }

    pub fn config(&self) -> &WorkerManConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<WorkerService> {
        &self.service
    }

    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    /// Processor settings from config, with an optional runtime override.
    pub fn processor_config(&self, runtime_secs: Option<u64>) -> JobProcessorConfig {
        let runtime = runtime_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.processor_runtime());
        JobProcessorConfig::default()
            .with_runtime(runtime)
            .with_idle_sleep(self.config.idle_sleep())
    }

    pub fn process(&self, processor: JobProcessorConfig, stop: &StopSignal) -> ProcessSummary {
        JobProcessor::new(processor).run(&self.service, stop)
    }

    pub fn schedule(
        &self,
        account_id: AccountId,
        tick_secs: Option<u64>,
        locks: Arc<dyn LockManager>,
        stop: &StopSignal,
    ) -> Result<LoopOutcome> {
        let loop_config = ScheduleLoopConfig {
            version: self.config.version.clone(),
            tick: tick_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.config.scheduler_tick()),
            lock_ttl: self.config.lock_ttl(),
        };
        let schedule_loop = ScheduleLoop::new(self.runner.clone(), locks, loop_config);
        schedule_loop
            .run(account_id, stop)
            .context("running the schedule loop")
    }

    pub fn enqueue(&self, worker_name: &str, workload_json: &str) -> Result<JobHandle> {
        let workload = Workload::from_json(workload_json).context("parsing workload")?;
        let handle = self
            .service
            .do_work_background(worker_name, workload)
            .with_context(|| format!("enqueueing a job for `{worker_name}`"))?;
        Ok(handle)
    }

    pub fn clear(&self, worker_name: &str) -> Result<usize> {
        let cleared = self
            .service
            .clear_worker_queue(worker_name)
            .with_context(|| format!("clearing the `{worker_name}` queue"))?;
        Ok(cleared)
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    workerman_observability::init(LogFormat::from_json_flag(config.log.json));

    let app = App::build(config, default_registry())?;

    match cli.command {
        Command::Process { runtime, daemon } => {
            let stop = StopSignal::new();
            stop_on_ctrl_c(stop.clone()).context("installing the Ctrl+C handler")?;

            let summary = app.process(app.processor_config(runtime), &stop);
            if daemon {
                info!(
                    processed = summary.processed,
                    errors = summary.errors,
                    exit = ?summary.exit,
                    "job processor finished"
                );
            } else {
                println!("Processed {} jobs", summary.processed);
            }
        }
        Command::Schedule { account, tick } => {
            let stop = StopSignal::new();
            stop_on_ctrl_c(stop.clone()).context("installing the Ctrl+C handler")?;

            let locks = build_lock_manager(app.config())?;
            let outcome = app.schedule(account, tick, locks, &stop)?;
            info!(account_id = %account, outcome = ?outcome, "schedule loop finished");
        }
        Command::Enqueue { worker, workload } => {
            if app.config().queue.backend == QueueBackend::Memory {
                info!("memory queue: the job is lost when this process exits");
            }
            let handle = app.enqueue(&worker, &workload)?;
            println!("{handle}");
        }
        Command::Clear { worker } => {
            let cleared = app.clear(&worker)?;
            println!("Cleared {cleared} jobs");
        }
    }

    Ok(())
}
