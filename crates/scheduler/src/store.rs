//! Scheduler persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use workerman_core::{AccountId, RecurringJobId, ScheduledJobId};

use crate::types::{RecurringJob, ScheduledJob};

/// Storage for scheduled jobs and recurring templates.
///
/// Every query is scoped to one account; reading another account's record by
/// id is an isolation error, never a silent miss.
pub trait SchedulerStore: Send + Sync {
    /// Insert or update a scheduled job. The id must be set.
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<(), SchedulerStoreError>;

    /// Insert a recurring instance unless one already exists for the same
    /// `(recurrence_id, execute_time)`. Returns whether a row was written.
    fn insert_recurring_instance(&self, job: &ScheduledJob) -> Result<bool, SchedulerStoreError>;

    fn get_scheduled_job(
        &self,
        account_id: AccountId,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerStoreError>;

    /// Unexecuted jobs with `execute_time <= to_date`, oldest first.
    fn queued_scheduled_jobs(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
        worker_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerStoreError>;

    /// Delete the unexecuted instances of a template. Returns the count.
    fn delete_pending_instances(
        &self,
        account_id: AccountId,
        recurrence_id: RecurringJobId,
    ) -> Result<usize, SchedulerStoreError>;

    /// Delete jobs executed before `older_than`. Returns the count.
    fn delete_executed_before(
        &self,
        account_id: AccountId,
        older_than: DateTime<Utc>,
    ) -> Result<usize, SchedulerStoreError>;

    /// Insert or update a recurring template. The id must be set.
    fn save_recurring_job(&self, job: &RecurringJob) -> Result<(), SchedulerStoreError>;

    fn get_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<Option<RecurringJob>, SchedulerStoreError>;

    /// Templates of an account, optionally for one worker, oldest first.
    fn list_recurring_jobs(
        &self,
        account_id: AccountId,
        worker_name: Option<&str>,
    ) -> Result<Vec<RecurringJob>, SchedulerStoreError>;

    /// Returns whether a template was deleted.
    fn delete_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<bool, SchedulerStoreError>;
}

impl<S> SchedulerStore for Arc<S>
where
    S: SchedulerStore + ?Sized,
{
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<(), SchedulerStoreError> {
        (**self).save_scheduled_job(job)
    }

    fn insert_recurring_instance(&self, job: &ScheduledJob) -> Result<bool, SchedulerStoreError> {
        (**self).insert_recurring_instance(job)
    }

    fn get_scheduled_job(
        &self,
        account_id: AccountId,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerStoreError> {
        (**self).get_scheduled_job(account_id, id)
    }

    fn queued_scheduled_jobs(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
        worker_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerStoreError> {
        (**self).queued_scheduled_jobs(account_id, to_date, worker_name)
    }

    fn delete_pending_instances(
        &self,
        account_id: AccountId,
        recurrence_id: RecurringJobId,
    ) -> Result<usize, SchedulerStoreError> {
        (**self).delete_pending_instances(account_id, recurrence_id)
    }

    fn delete_executed_before(
        &self,
        account_id: AccountId,
        older_than: DateTime<Utc>,
    ) -> Result<usize, SchedulerStoreError> {
        (**self).delete_executed_before(account_id, older_than)
    }

    fn save_recurring_job(&self, job: &RecurringJob) -> Result<(), SchedulerStoreError> {
        (**self).save_recurring_job(job)
    }

    fn get_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<Option<RecurringJob>, SchedulerStoreError> {
        (**self).get_recurring_job(account_id, id)
    }

    fn list_recurring_jobs(
        &self,
        account_id: AccountId,
        worker_name: Option<&str>,
    ) -> Result<Vec<RecurringJob>, SchedulerStoreError> {
        (**self).list_recurring_jobs(account_id, worker_name)
    }

    fn delete_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<bool, SchedulerStoreError> {
        (**self).delete_recurring_job(account_id, id)
    }
}

/// Scheduler store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerStoreError {
    #[error("record has no id; assign one before saving")]
    MissingId,
    #[error("scheduled job is not a recurring instance")]
    NotAnInstance,
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// In-memory scheduler store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySchedulerStore {
    scheduled: RwLock<HashMap<ScheduledJobId, ScheduledJob>>,
    recurring: RwLock<HashMap<RecurringJobId, RecurringJob>>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored scheduled jobs across all accounts.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl SchedulerStore for InMemorySchedulerStore {
    fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<(), SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        let mut scheduled = self.scheduled.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = scheduled.get(&id) {
            if existing.account_id != job.account_id {
                return Err(SchedulerStoreError::TenantIsolation);
            }
        }
        scheduled.insert(id, job.clone());
        Ok(())
    }

    fn insert_recurring_instance(&self, job: &ScheduledJob) -> Result<bool, SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        let recurrence_id = job.recurrence_id.ok_or(SchedulerStoreError::NotAnInstance)?;
        let mut scheduled = self.scheduled.write().unwrap_or_else(|e| e.into_inner());
        let exists = scheduled
            .values()
            .any(|j| j.recurrence_id == Some(recurrence_id) && j.execute_time == job.execute_time);
        if exists {
            return Ok(false);
        }
        scheduled.insert(id, job.clone());
        Ok(true)
    }

    fn get_scheduled_job(
        &self,
        account_id: AccountId,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerStoreError> {
        let scheduled = self.scheduled.read().unwrap_or_else(|e| e.into_inner());
        match scheduled.get(&id) {
            Some(job) if job.account_id == account_id => Ok(Some(job.clone())),
            Some(_) => Err(SchedulerStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn queued_scheduled_jobs(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
        worker_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerStoreError> {
        let scheduled = self.scheduled.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = scheduled
            .values()
            .filter(|j| {
                j.account_id == account_id
                    && j.time_executed.is_none()
                    && j.execute_time <= to_date
                    && worker_name.is_none_or(|name| j.worker_name == name)
            })
            .cloned()
            .collect();

        // UUIDv7 ids break ties in creation order.
        result.sort_by_key(|j| (j.execute_time, j.id));
        Ok(result)
    }

    fn delete_pending_instances(
        &self,
        account_id: AccountId,
        recurrence_id: RecurringJobId,
    ) -> Result<usize, SchedulerStoreError> {
        let mut scheduled = self.scheduled.write().unwrap_or_else(|e| e.into_inner());
        let before = scheduled.len();
        scheduled.retain(|_, j| {
            !(j.account_id == account_id
                && j.recurrence_id == Some(recurrence_id)
                && j.time_executed.is_none())
        });
        Ok(before - scheduled.len())
    }

    fn delete_executed_before(
        &self,
        account_id: AccountId,
        older_than: DateTime<Utc>,
    ) -> Result<usize, SchedulerStoreError> {
        let mut scheduled = self.scheduled.write().unwrap_or_else(|e| e.into_inner());
        let before = scheduled.len();
        scheduled.retain(|_, j| {
            !(j.account_id == account_id && j.time_executed.is_some_and(|t| t < older_than))
        });
        Ok(before - scheduled.len())
    }

    fn save_recurring_job(&self, job: &RecurringJob) -> Result<(), SchedulerStoreError> {
        let id = job.id.ok_or(SchedulerStoreError::MissingId)?;
        let mut recurring = self.recurring.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = recurring.get(&id) {
            if existing.account_id != job.account_id {
                return Err(SchedulerStoreError::TenantIsolation);
            }
        }
        recurring.insert(id, job.clone());
        Ok(())
    }

    fn get_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<Option<RecurringJob>, SchedulerStoreError> {
        let recurring = self.recurring.read().unwrap_or_else(|e| e.into_inner());
        match recurring.get(&id) {
            Some(job) if job.account_id == account_id => Ok(Some(job.clone())),
            Some(_) => Err(SchedulerStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list_recurring_jobs(
        &self,
        account_id: AccountId,
        worker_name: Option<&str>,
    ) -> Result<Vec<RecurringJob>, SchedulerStoreError> {
        let recurring = self.recurring.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = recurring
            .values()
            .filter(|j| {
                j.account_id == account_id && worker_name.is_none_or(|name| j.worker_name == name)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn delete_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<bool, SchedulerStoreError> {
        let mut recurring = self.recurring.write().unwrap_or_else(|e| e.into_inner());
        match recurring.get(&id) {
            Some(job) if job.account_id == account_id => {
                recurring.remove(&id);
                Ok(true)
            }
            Some(_) => Err(SchedulerStoreError::TenantIsolation),
            None => Ok(false),
        }
    }
}

/// Store wrapper that fails chosen writes once.
#[cfg(test)]
pub(crate) mod faulty {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct FaultyStore {
        inner: InMemorySchedulerStore,
        inserts: AtomicUsize,
        fail_insert: AtomicUsize,
        fail_cursor: AtomicBool,
        fail_mark: AtomicBool,
    }

    impl FaultyStore {
        pub(crate) fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Fail the n-th recurring instance insert (1-based).
        pub(crate) fn fail_insert_at(&self, n: usize) {
            self.fail_insert.store(n, Ordering::SeqCst);
        }

        /// Fail the next template save that moves its materialization cursor.
        pub(crate) fn fail_next_cursor_save(&self) {
            self.fail_cursor.store(true, Ordering::SeqCst);
        }

        /// Fail the next save that marks a scheduled job executed.
        pub(crate) fn fail_next_mark(&self) {
            self.fail_mark.store(true, Ordering::SeqCst);
        }

        pub(crate) fn scheduled_len(&self) -> usize {
            self.inner.scheduled_len()
        }

        fn down() -> SchedulerStoreError {
            SchedulerStoreError::Storage("connection reset".to_string())
        }
    }

    impl SchedulerStore for FaultyStore {
        fn save_scheduled_job(&self, job: &ScheduledJob) -> Result<(), SchedulerStoreError> {
            if job.time_executed.is_some() && self.fail_mark.swap(false, Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.save_scheduled_job(job)
        }

        fn insert_recurring_instance(&self, job: &ScheduledJob) -> Result<bool, SchedulerStoreError> {
            let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_insert.load(Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.insert_recurring_instance(job)
        }

        fn get_scheduled_job(
            &self,
            account_id: AccountId,
            id: ScheduledJobId,
        ) -> Result<Option<ScheduledJob>, SchedulerStoreError> {
            self.inner.get_scheduled_job(account_id, id)
        }

        fn queued_scheduled_jobs(
            &self,
            account_id: AccountId,
            to_date: DateTime<Utc>,
            worker_name: Option<&str>,
        ) -> Result<Vec<ScheduledJob>, SchedulerStoreError> {
            self.inner.queued_scheduled_jobs(account_id, to_date, worker_name)
        }

        fn delete_pending_instances(
            &self,
            account_id: AccountId,
            recurrence_id: RecurringJobId,
        ) -> Result<usize, SchedulerStoreError> {
            self.inner.delete_pending_instances(account_id, recurrence_id)
        }

        fn delete_executed_before(
            &self,
            account_id: AccountId,
            older_than: DateTime<Utc>,
        ) -> Result<usize, SchedulerStoreError> {
            self.inner.delete_executed_before(account_id, older_than)
        }

        fn save_recurring_job(&self, job: &RecurringJob) -> Result<(), SchedulerStoreError> {
            if job.time_last_scheduled.is_some() && self.fail_cursor.swap(false, Ordering::SeqCst) {
                return Err(Self::down());
            }
            self.inner.save_recurring_job(job)
        }

        fn get_recurring_job(
            &self,
            account_id: AccountId,
            id: RecurringJobId,
        ) -> Result<Option<RecurringJob>, SchedulerStoreError> {
            self.inner.get_recurring_job(account_id, id)
        }

        fn list_recurring_jobs(
            &self,
            account_id: AccountId,
            worker_name: Option<&str>,
        ) -> Result<Vec<RecurringJob>, SchedulerStoreError> {
            self.inner.list_recurring_jobs(account_id, worker_name)
        }

        fn delete_recurring_job(
            &self,
            account_id: AccountId,
            id: RecurringJobId,
        ) -> Result<bool, SchedulerStoreError> {
            self.inner.delete_recurring_job(account_id, id)
        }
    }
}
