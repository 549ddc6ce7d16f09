//! Postgres-backed scheduler store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SchedulerStoreError |
//! |------------|---------------------|
//! | Decode / ColumnDecode / bad JSON | `Serialization` |
//! | Anything else | `Storage` |
//!
//! ## Thread Safety
//!
//! `SchedulerStore` is synchronous; this store owns a current-thread tokio
//! runtime and blocks on it. It must not be called from inside another tokio
//! runtime.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::runtime::Runtime;
use tracing::{debug, instrument};
use uuid::Uuid;

use workerman_core::{AccountId, RecurringJobId, ScheduledJobId, Workload};
use workerman_scheduler::{RecurringJob, ScheduledJob, SchedulerStore, SchedulerStoreError};

/// Schema shipped in `migrations/`.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_worker_schedule.sql");

const SCHEDULED_COLUMNS: &str =
    "id, account_id, worker_name, job_data, execute_time, recurrence_id, time_executed";

const RECURRING_COLUMNS: &str = "id, account_id, worker_name, job_data, interval_unit, \
     interval_count, time_last_executed, time_last_scheduled, created_at";

#[derive(Debug)]
pub struct PostgresSchedulerStore {
    pool: PgPool,
    runtime: Runtime,
}

impl PostgresSchedulerStore {
    /// Connect to `database_url` with a small pool.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, SchedulerStoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SchedulerStoreError::Storage(format!("tokio runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool, runtime })
    }

    /// Create the tables if they do not exist.
    pub fn migrate(&self) -> Result<(), SchedulerStoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("scheduler schema applied");
        Ok(())
    }

    /// Upsert that refuses to move a row to another account.
    async fn upsert_scheduled(&self, job: &ScheduledJob, id: Uuid) -> Result<(), SchedulerStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO worker_scheduled_jobs
                (id, account_id, worker_name, job_data, execute_time, recurrence_id, time_executed)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                worker_name = EXCLUDED.worker_name,
                job_data = EXCLUDED.job_data,
                execute_time = EXCLUDED.execute_time,
                recurrence_id = EXCLUDED.recurrence_id,
                time_executed = EXCLUDED.time_executed
            WHERE worker_scheduled_jobs.account_id = EXCLUDED.account_id
            "#,
        )
        .bind(id)
        .bind(*job.account_id.as_uuid())
        .bind(&job.worker_name)
        .bind(job.job_data.clone().into_value())
        .bind(job.execute_time)
        .bind(job.recurrence_id.map(Uuid::from))
        .bind(job.time_executed)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_scheduled_job", e))?;

        if result.rows_affected() == 0 {
            return Err(SchedulerStoreError::TenantIsolation);
        }
        Ok(())
    }

    async fn upsert_recurring(&self, job: &RecurringJob, id: Uuid) -> Result<(), SchedulerStoreError> {
        let interval = i32::try_from(job.interval)
            .map_err(|_| SchedulerStoreError::Serialization("interval out of range".to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO worker_recurring_jobs
                (id, account_id, worker_name, job_data, interval_unit, interval_count,
                 time_last_executed, time_last_scheduled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                worker_name = EXCLUDED.worker_name,
                job_data = EXCLUDED.job_data,
                interval_unit = EXCLUDED.interval_unit,
                interval_count = EXCLUDED.interval_count,
                time_last_executed = EXCLUDED.time_last_executed,
                time_last_scheduled = EXCLUDED.time_last_scheduled
            WHERE worker_recurring_jobs.account_id = EXCLUDED.account_id
            "#,
        )
        .bind(id)
        .bind(*job.account_id.as_uuid())
        .bind(&job.worker_name)
        .bind(job.job_data.clone().into_value())
        .bind(job.interval_unit.as_str())
        .bind(interval)
        .bind(job.time_last_executed)
        .bind(job.time_last_scheduled)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_recurring_job", e))?;

        if result.rows_affected() == 0 {
            return Err(SchedulerStoreError::TenantIsolation);
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SchedulerStoreError {
    match err {
        sqlx::Error::Decode(e) => SchedulerStoreError::Serialization(format!("{operation}: {e}")),
        sqlx::Error::ColumnDecode { index, source } => {
            SchedulerStoreError::Serialization(format!("{operation}: column {index}: {source}"))
        }
        other => SchedulerStoreError::Storage(format!("{operation}: {other}")),
    }
}

fn workload_from_row(row: &PgRow) -> Result<Workload, SchedulerStoreError> {
    let value: serde_json::Value = row
        .try_get("job_data")
        .map_err(|e| map_sqlx_error("job_data", e))?;
    Workload::from_value(value).map_err(|e| SchedulerStoreError::Serialization(e.to_string()))
}

fn scheduled_from_row(row: &PgRow) -> Result<ScheduledJob, SchedulerStoreError> {
    let get = |e| map_sqlx_error("scheduled row", e);
    let id: Uuid = row.try_get("id").map_err(get)?;
    let account_id: Uuid = row.try_get("account_id").map_err(get)?;
    let recurrence_id: Option<Uuid> = row.try_get("recurrence_id").map_err(get)?;

    Ok(ScheduledJob {
        id: Some(ScheduledJobId::from_uuid(id)),
        account_id: AccountId::from_uuid(account_id),
        worker_name: row.try_get("worker_name").map_err(get)?,
        job_data: workload_from_row(row)?,
        execute_time: row.try_get("execute_time").map_err(get)?,
        recurrence_id: recurrence_id.map(RecurringJobId::from_uuid),
        time_executed: row.try_get("time_executed").map_err(get)?,
    })
}

fn recurring_from_row(row: &PgRow) -> Result<RecurringJob, SchedulerStoreError> {
    let get = |e| map_sqlx_error("recurring row", e);
    let id: Uuid = row.try_get("id").map_err(get)?;
    let account_id: Uuid = row.try_get("account_id").map_err(get)?;
    let unit: String = row.try_get("interval_unit").map_err(get)?;
    let interval: i32 = row.try_get("interval_count").map_err(get)?;

    Ok(RecurringJob {
        id: Some(RecurringJobId::from_uuid(id)),
        account_id: AccountId::from_uuid(account_id),
        worker_name: row.try_get("worker_name").map_err(get)?,
        job_data: workload_from_row(row)?,
        interval_unit: unit
            .parse()
            .map_err(|e| SchedulerStoreError::Serialization(format!("{e}")))?,
        interval: u32::try_from(interval)
            .map_err(|_| SchedulerStoreError::Serialization(format!("bad interval {interval}")))?,
        time_last_executed: row.try_get("time_last_executed").map_err(get)?,
        time_last_scheduled: row.try_get("time_last_scheduled").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
    })
}

impl SchedulerStore for PostgresSchedulerStore {
    #[instrument(skip(self, job), fields(account_id = %job.account_id), err)]
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<(), SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        self.runtime.block_on(self.upsert_scheduled(job, id.into()))
    }

    #[instrument(skip(self, job), fields(account_id = %job.account_id), err)]
    fn insert_recurring_instance(&self, job: &ScheduledJob) -> Result<bool, SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        let recurrence_id = job.recurrence_id.ok_or(SchedulerStoreError::NotAnInstance)?;

        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO worker_scheduled_jobs
                        (id, account_id, worker_name, job_data, execute_time, recurrence_id, time_executed)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (recurrence_id, execute_time) WHERE recurrence_id IS NOT NULL
                    DO NOTHING
                    "#,
                )
                .bind(*id.as_uuid())
                .bind(*job.account_id.as_uuid())
                .bind(&job.worker_name)
                .bind(job.job_data.clone().into_value())
                .bind(job.execute_time)
                .bind(*recurrence_id.as_uuid())
                .bind(job.time_executed)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("insert_recurring_instance", e))?;

        Ok(result.rows_affected() > 0)
    }

    fn get_scheduled_job(
        &self,
        account_id: AccountId,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerStoreError> {
        let sql = format!("SELECT {SCHEDULED_COLUMNS} FROM worker_scheduled_jobs WHERE id = $1");
        let row = self
            .runtime
            .block_on(sqlx::query(&sql).bind(*id.as_uuid()).fetch_optional(&self.pool))
            .map_err(|e| map_sqlx_error("get_scheduled_job", e))?;

        match row.map(|r| scheduled_from_row(&r)).transpose()? {
            Some(job) if job.account_id == account_id => Ok(Some(job)),
            Some(_) => Err(SchedulerStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(account_id = %account_id), err)]
    fn queued_scheduled_jobs(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
        worker_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerStoreError> {
        let sql = format!(
            "SELECT {SCHEDULED_COLUMNS} FROM worker_scheduled_jobs \
             WHERE account_id = $1 AND time_executed IS NULL AND execute_time <= $2 \
               AND ($3::text IS NULL OR worker_name = $3) \
             ORDER BY execute_time ASC, id ASC"
        );
        let rows = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(*account_id.as_uuid())
                    .bind(to_date)
                    .bind(worker_name)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("queued_scheduled_jobs", e))?;

        rows.iter().map(scheduled_from_row).collect()
    }

    fn delete_pending_instances(
        &self,
        account_id: AccountId,
        recurrence_id: RecurringJobId,
    ) -> Result<usize, SchedulerStoreError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    "DELETE FROM worker_scheduled_jobs \
                     WHERE account_id = $1 AND recurrence_id = $2 AND time_executed IS NULL",
                )
                .bind(*account_id.as_uuid())
                .bind(*recurrence_id.as_uuid())
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("delete_pending_instances", e))?;
        Ok(result.rows_affected() as usize)
    }

    fn delete_executed_before(
        &self,
        account_id: AccountId,
        older_than: DateTime<Utc>,
    ) -> Result<usize, SchedulerStoreError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    "DELETE FROM worker_scheduled_jobs \
                     WHERE account_id = $1 AND time_executed IS NOT NULL AND time_executed < $2",
                )
                .bind(*account_id.as_uuid())
                .bind(older_than)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("delete_executed_before", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, job), fields(account_id = %job.account_id), err)]
    fn save_recurring_job(&self, job: &RecurringJob) -> Result<(), SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        self.runtime.block_on(self.upsert_recurring(job, id.into()))
    }

    fn get_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<Option<RecurringJob>, SchedulerStoreError> {
        let sql = format!("SELECT {RECURRING_COLUMNS} FROM worker_recurring_jobs WHERE id = $1");
        let row = self
            .runtime
            .block_on(sqlx::query(&sql).bind(*id.as_uuid()).fetch_optional(&self.pool))
            .map_err(|e| map_sqlx_error("get_recurring_job", e))?;

        match row.map(|r| recurring_from_row(&r)).transpose()? {
            Some(job) if job.account_id == account_id => Ok(Some(job)),
            Some(_) => Err(SchedulerStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list_recurring_jobs(
        &self,
        account_id: AccountId,
        worker_name: Option<&str>,
    ) -> Result<Vec<RecurringJob>, SchedulerStoreError> {
        let sql = format!(
            "SELECT {RECURRING_COLUMNS} FROM worker_recurring_jobs \
             WHERE account_id = $1 AND ($2::text IS NULL OR worker_name = $2) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(*account_id.as_uuid())
                    .bind(worker_name)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_recurring_jobs", e))?;

        rows.iter().map(recurring_from_row).collect()
    }

    fn delete_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<bool, SchedulerStoreError> {
        if self.get_recurring_job(account_id, id)?.is_none() {
            return Ok(false);
        }

        let result = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM worker_recurring_jobs WHERE account_id = $1 AND id = $2")
                    .bind(*account_id.as_uuid())
                    .bind(*id.as_uuid())
                    .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("delete_recurring_job", e))?;
        Ok(result.rows_affected() > 0)
    }
}
