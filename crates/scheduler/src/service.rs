//! Persisted one-shot and recurring job scheduling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use workerman_core::{AccountId, RecurringJobId, ScheduledJobId, Workload};
use workerman_queue::{ScheduleError, WorkScheduler};

use crate::store::{SchedulerStore, SchedulerStoreError};
use crate::types::{IntervalUnit, RecurringJob, ScheduledJob};

/// Occurrences one template may need for a single horizon before
/// materialization is refused instead of flooding the store.
pub const MAX_OCCURRENCES_PER_HORIZON: usize = 100_000;

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("interval must be a positive integer")]
    InvalidInterval,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("recurring job {recurring_job_id} has more than {limit} occurrences up to {to_date}")]
    HorizonTooFar {
        recurring_job_id: String,
        to_date: DateTime<Utc>,
        limit: usize,
    },
    #[error(transparent)]
    Store(#[from] SchedulerStoreError),
}

/// Creates, materializes and completes scheduled work.
///
/// State per job: `Pending` → `Due` (execute time reached) → `Executed`.
/// There is no retry state; a due job is handed to the queue once.
#[derive(Clone)]
pub struct SchedulerService {
    store: Arc<dyn SchedulerStore>,
}

impl SchedulerService {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SchedulerStore> {
        &self.store
    }

    /// Persist a one-shot job. No uniqueness is enforced.
    pub fn schedule_at_time(
        &self,
        account_id: AccountId,
        worker_name: &str,
        execute_time: DateTime<Utc>,
        job_data: Workload,
    ) -> Result<ScheduledJobId, SchedulerError> {
        validate_worker_name(worker_name)?;

        let mut job = ScheduledJob::new(account_id, worker_name, job_data, execute_time);
        let id = ScheduledJobId::new();
        job.id = Some(id);
        self.store.save_scheduled_job(&job)?;

        debug!(
            account_id = %account_id,
            scheduled_job_id = %id,
            worker = %worker_name,
            execute_time = %execute_time,
            "job scheduled"
        );
        Ok(id)
    }

    /// Persist a recurring template. Always creates a new one; use
    /// [`SchedulerService::find_recurring`] first to avoid duplicates.
    ///
    /// The first occurrence is due immediately.
    pub fn schedule_at_interval(
        &self,
        account_id: AccountId,
        worker_name: &str,
        job_data: Workload,
        interval_unit: IntervalUnit,
        interval: u32,
    ) -> Result<RecurringJobId, SchedulerError> {
        validate_worker_name(worker_name)?;
        if interval == 0 {
            return Err(SchedulerError::InvalidInterval);
        }

        let mut template = RecurringJob::new(
            account_id,
            worker_name,
            job_data,
            interval_unit,
            interval,
            Utc::now(),
        );
        let id = RecurringJobId::new();
        template.id = Some(id);
        self.store.save_recurring_job(&template)?;

        info!(
            account_id = %account_id,
            recurring_job_id = %id,
            worker = %worker_name,
            interval,
            unit = %interval_unit,
            "recurring job created"
        );
        Ok(id)
    }

    /// Materialize due recurring instances, then return every unexecuted job
    /// due by `to_date` (optionally for one worker), oldest first.
    pub fn get_scheduled_to_run(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
        worker_name: Option<&str>,
    ) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.materialize_recurring(account_id, to_date)?;
        Ok(self
            .store
            .queued_scheduled_jobs(account_id, to_date, worker_name)?)
    }

    /// Jobs due right now.
    pub fn get_due_now(&self, account_id: AccountId) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.get_scheduled_to_run(account_id, Utc::now(), None)
    }

    /// Create one instance per interval boundary `<= to_date` not yet
    /// materialized. Returns the number of instances created.
    ///
    /// Instances are unique per `(recurrence_id, execute_time)`, so a pass
    /// that fails halfway is simply repeated: boundaries already written are
    /// skipped and the template cursor catches up once every write succeeds.
    pub fn materialize_recurring(
        &self,
        account_id: AccountId,
        to_date: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let mut total = 0;

        for mut template in self.store.list_recurring_jobs(account_id, None)? {
            let due = due_occurrences(&template, to_date)?;
            let Some(&last) = due.last() else {
                continue;
            };

            let mut created = 0;
            for execute_time in due {
                let mut instance = template.instance(execute_time);
                instance.id = Some(ScheduledJobId::new());
                if self.store.insert_recurring_instance(&instance)? {
                    created += 1;
                }
            }

            template.time_last_scheduled = Some(last);
            self.store.save_recurring_job(&template)?;
            total += created;
        }

        if total > 0 {
            debug!(account_id = %account_id, created = total, "recurring instances materialized");
        }
        Ok(total)
    }

    /// Mark a job as handed off. Idempotent.
    ///
    /// For a recurring instance the template's `time_last_executed` becomes
    /// the later of its current value and the instance's execute time.
    pub fn set_job_as_executed(&self, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let id = job
            .id
            .ok_or_else(|| SchedulerError::NotFound("scheduled job has not been saved".to_string()))?;

        let mut stored = self
            .store
            .get_scheduled_job(job.account_id, id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("scheduled job {id}")))?;

        if stored.time_executed.is_none() {
            stored.time_executed = Some(Utc::now());
            self.store.save_scheduled_job(&stored)?;
        }

        if let Some(recurrence_id) = stored.recurrence_id {
            match self.store.get_recurring_job(stored.account_id, recurrence_id)? {
                Some(mut template) => {
                    let anchor = match template.time_last_executed {
                        Some(current) => current.max(stored.execute_time),
                        None => stored.execute_time,
                    };
                    if template.time_last_executed != Some(anchor) {
                        template.time_last_executed = Some(anchor);
                        self.store.save_recurring_job(&template)?;
                    }
                }
                None => debug!(
                    recurring_job_id = %recurrence_id,
                    "template deleted before its instance completed"
                ),
            }
        }

        Ok(stored)
    }

    /// Alias of [`SchedulerService::set_job_as_executed`].
    pub fn mark_completed(&self, job: &ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        self.set_job_as_executed(job)
    }

    pub fn get_scheduled_job(
        &self,
        account_id: AccountId,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.store.get_scheduled_job(account_id, id)?)
    }

    pub fn get_recurring_job(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<Option<RecurringJob>, SchedulerError> {
        Ok(self.store.get_recurring_job(account_id, id)?)
    }

    /// Templates of an account targeting `worker_name`.
    pub fn find_recurring(
        &self,
        account_id: AccountId,
        worker_name: &str,
    ) -> Result<Vec<RecurringJob>, SchedulerError> {
        Ok(self.store.list_recurring_jobs(account_id, Some(worker_name))?)
    }

    /// Delete a template and its unexecuted instances.
    pub fn delete_recurring(
        &self,
        account_id: AccountId,
        id: RecurringJobId,
    ) -> Result<bool, SchedulerError> {
        let instances = self.store.delete_pending_instances(account_id, id)?;
        let deleted = self.store.delete_recurring_job(account_id, id)?;
        info!(
            account_id = %account_id,
            recurring_job_id = %id,
            deleted,
            instances,
            "recurring job deleted"
        );
        Ok(deleted)
    }

    /// Drop executed jobs older than `older_than`.
    pub fn purge_executed(
        &self,
        account_id: AccountId,
        older_than: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        let purged = self.store.delete_executed_before(account_id, older_than)?;
        debug!(account_id = %account_id, purged, "executed jobs purged");
        Ok(purged)
    }
}

impl WorkScheduler for SchedulerService {
    fn schedule_work(
        &self,
        account_id: AccountId,
        worker_name: &str,
        workload: Workload,
        execute_time: DateTime<Utc>,
    ) -> Result<ScheduledJobId, ScheduleError> {
        self.schedule_at_time(account_id, worker_name, execute_time, workload)
            .map_err(|e| Box::new(e) as ScheduleError)
    }
}

impl core::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SchedulerService").finish_non_exhaustive()
    }
}

/// Execute times of `template` from its cursor up to `to_date`.
fn due_occurrences(
    template: &RecurringJob,
    to_date: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let mut cursor = template.clone();
    let mut due = Vec::new();

    while let Some(next) = cursor.next_execute_time() {
        if next > to_date {
            break;
        }
        if due.len() == MAX_OCCURRENCES_PER_HORIZON {
            warn!(
                account_id = %template.account_id,
                recurring_job_id = ?template.id,
                worker = %template.worker_name,
                to_date = %to_date,
                limit = MAX_OCCURRENCES_PER_HORIZON,
                "materialization horizon too far"
            );
            return Err(SchedulerError::HorizonTooFar {
                recurring_job_id: template.id.map(|id| id.to_string()).unwrap_or_default(),
                to_date,
                limit: MAX_OCCURRENCES_PER_HORIZON,
            });
        }
        due.push(next);
        cursor.time_last_scheduled = Some(next);
    }

    Ok(due)
}

fn validate_worker_name(worker_name: &str) -> Result<(), SchedulerError> {
    if worker_name.trim().is_empty() {
        return Err(SchedulerError::InvalidArgument(
            "worker_name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySchedulerStore;
    use crate::store::faulty::FaultyStore;
    use chrono::{Datelike, Duration, TimeZone};
    use std::collections::HashSet;

    fn scheduler() -> SchedulerService {
        SchedulerService::new(InMemorySchedulerStore::arc())
    }

    #[test]
    fn one_shot_is_due_at_its_execute_time_only() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let t = Utc::now() + Duration::minutes(10);

        let id = scheduler
            .schedule_at_time(account, "Test", t, Workload::new().with("mystring", "x"))
            .unwrap();

        let due = scheduler.get_scheduled_to_run(account, t, None).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, Some(id));
        assert_eq!(due[0].job_data.get("mystring"), Some(&"x".into()));

        let early = scheduler
            .get_scheduled_to_run(account, t - Duration::milliseconds(1), None)
            .unwrap();
        assert!(early.is_empty());
    }

    #[test]
    fn worker_filter_and_tenant_scope() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let now = Utc::now();

        scheduler.schedule_at_time(account, "A", now, Workload::new()).unwrap();
        scheduler.schedule_at_time(account, "B", now, Workload::new()).unwrap();
        scheduler
            .schedule_at_time(AccountId::new(), "A", now, Workload::new())
            .unwrap();

        assert_eq!(scheduler.get_scheduled_to_run(account, now, Some("A")).unwrap().len(), 1);
        assert_eq!(scheduler.get_scheduled_to_run(account, now, None).unwrap().len(), 2);
    }

    #[test]
    fn empty_worker_name_is_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule_at_time(AccountId::new(), " ", Utc::now(), Workload::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule_at_interval(AccountId::new(), "X", Workload::new(), IntervalUnit::Day, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval));
    }

    #[test]
    fn daily_interval_materializes_each_day_once() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let recurring_id = scheduler
            .schedule_at_interval(account, "X", Workload::new(), IntervalUnit::Day, 1)
            .unwrap();

        let horizon = Utc::now() + Duration::days(3);
        let first = scheduler.get_scheduled_to_run(account, horizon, None).unwrap();
        assert!(first.len() >= 3, "got {}", first.len());
        assert!(first.iter().all(|j| j.recurrence_id == Some(recurring_id)));

        let times: Vec<_> = first.iter().map(|j| j.execute_time).collect();
        let distinct: HashSet<_> = times.iter().collect();
        assert_eq!(distinct.len(), times.len());
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::days(1));
        }

        let second = scheduler.get_scheduled_to_run(account, horizon, None).unwrap();
        let first_ids: Vec<_> = first.iter().map(|j| j.id).collect();
        let second_ids: Vec<_> = second.iter().map(|j| j.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    fn save_template(
        scheduler: &SchedulerService,
        account: AccountId,
        unit: IntervalUnit,
        created: DateTime<Utc>,
    ) {
        let mut template = RecurringJob::new(account, "Tick", Workload::new(), unit, 1, created);
        template.id = Some(RecurringJobId::new());
        scheduler.store().save_recurring_job(&template).unwrap();
    }

    #[test]
    fn materialization_reaches_the_horizon_in_one_pass() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        save_template(&scheduler, account, IntervalUnit::Hour, created);

        let horizon = created + Duration::days(5);
        assert_eq!(scheduler.materialize_recurring(account, horizon).unwrap(), 121);
        assert_eq!(scheduler.materialize_recurring(account, horizon).unwrap(), 0);

        let due = scheduler.get_scheduled_to_run(account, horizon, None).unwrap();
        assert_eq!(due.len(), 121);
        assert_eq!(due.last().map(|j| j.execute_time), Some(horizon));
    }

    #[test]
    fn horizon_beyond_the_limit_is_an_error() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        save_template(&scheduler, account, IntervalUnit::Minute, created);

        let horizon = created + Duration::minutes(MAX_OCCURRENCES_PER_HORIZON as i64);
        let err = scheduler.materialize_recurring(account, horizon).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::HorizonTooFar { limit: MAX_OCCURRENCES_PER_HORIZON, .. }
        ));
        assert!(scheduler.get_scheduled_to_run(account, horizon, None).is_err());

        // Nothing is written and the cursor stays put.
        assert_eq!(scheduler.materialize_recurring(account, created).unwrap(), 1);
        assert_eq!(scheduler.get_scheduled_to_run(account, created, None).unwrap().len(), 1);
    }

    #[test]
    fn month_end_template_materializes_every_month_end() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let created = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        save_template(&scheduler, account, IntervalUnit::Month, created);

        let horizon = Utc.with_ymd_and_hms(2024, 5, 31, 9, 0, 0).unwrap();
        let days: Vec<_> = scheduler
            .get_scheduled_to_run(account, horizon, None)
            .unwrap()
            .iter()
            .map(|j| (j.execute_time.month(), j.execute_time.day()))
            .collect();
        assert_eq!(days, vec![(1, 31), (2, 29), (3, 31), (4, 30), (5, 31)]);
    }

    fn assert_one_instance_per_hour(store: &FaultyStore, account: AccountId, horizon: DateTime<Utc>) {
        let jobs = store.queued_scheduled_jobs(account, horizon, None).unwrap();
        let times: Vec<_> = jobs.iter().map(|j| j.execute_time).collect();
        let distinct: HashSet<_> = times.iter().collect();
        assert_eq!(times.len(), 6);
        assert_eq!(distinct.len(), 6);
    }

    #[test]
    fn failed_insert_is_retried_without_duplicates() {
        let store = FaultyStore::arc();
        store.fail_insert_at(3);
        let scheduler = SchedulerService::new(store.clone());
        let account = AccountId::new();
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        save_template(&scheduler, account, IntervalUnit::Hour, created);
        let horizon = created + Duration::hours(5);

        assert!(matches!(
            scheduler.materialize_recurring(account, horizon),
            Err(SchedulerError::Store(SchedulerStoreError::Storage(_)))
        ));
        assert_eq!(store.scheduled_len(), 2);

        assert_eq!(scheduler.materialize_recurring(account, horizon).unwrap(), 4);
        assert_one_instance_per_hour(&store, account, horizon);
    }

    #[test]
    fn failed_cursor_save_is_retried_without_duplicates() {
        let store = FaultyStore::arc();
        store.fail_next_cursor_save();
        let scheduler = SchedulerService::new(store.clone());
        let account = AccountId::new();
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        save_template(&scheduler, account, IntervalUnit::Hour, created);
        let horizon = created + Duration::hours(5);

        assert!(scheduler.materialize_recurring(account, horizon).is_err());
        assert_eq!(scheduler.materialize_recurring(account, horizon).unwrap(), 0);
        assert_one_instance_per_hour(&store, account, horizon);

        let template = &store.list_recurring_jobs(account, None).unwrap()[0];
        assert_eq!(template.time_last_scheduled, Some(horizon));
    }

    #[test]
    fn set_job_as_executed_is_idempotent() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let now = Utc::now();
        scheduler.schedule_at_time(account, "Test", now, Workload::new()).unwrap();

        let job = scheduler.get_scheduled_to_run(account, now, None).unwrap().remove(0);
        let first = scheduler.set_job_as_executed(&job).unwrap();
        let second = scheduler.mark_completed(&job).unwrap();

        assert!(first.time_executed.is_some());
        assert_eq!(first.time_executed, second.time_executed);
        assert!(scheduler.get_scheduled_to_run(account, now, None).unwrap().is_empty());
    }

    #[test]
    fn unsaved_job_cannot_be_marked() {
        let scheduler = scheduler();
        let job = ScheduledJob::new(AccountId::new(), "Test", Workload::new(), Utc::now());
        assert!(matches!(
            scheduler.set_job_as_executed(&job),
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[test]
    fn executing_an_instance_advances_the_template_anchor() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let recurring_id = scheduler
            .schedule_at_interval(account, "Digest", Workload::new(), IntervalUnit::Hour, 1)
            .unwrap();

        let horizon = Utc::now() + Duration::hours(2);
        let due = scheduler.get_scheduled_to_run(account, horizon, None).unwrap();
        assert!(due.len() >= 2);

        scheduler.set_job_as_executed(&due[1]).unwrap();
        let template = scheduler.get_recurring_job(account, recurring_id).unwrap().unwrap();
        assert_eq!(template.time_last_executed, Some(due[1].execute_time));

        // Completing an older instance later never moves the anchor back.
        scheduler.set_job_as_executed(&due[0]).unwrap();
        let template = scheduler.get_recurring_job(account, recurring_id).unwrap().unwrap();
        let anchor = template.time_last_executed.unwrap();
        assert!(anchor >= due[1].execute_time);
    }

    #[test]
    fn delete_recurring_removes_pending_instances() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let id = scheduler
            .schedule_at_interval(account, "Digest", Workload::new(), IntervalUnit::Day, 1)
            .unwrap();
        let horizon = Utc::now() + Duration::days(2);
        assert!(!scheduler.get_scheduled_to_run(account, horizon, None).unwrap().is_empty());

        assert!(scheduler.delete_recurring(account, id).unwrap());
        assert!(scheduler.find_recurring(account, "Digest").unwrap().is_empty());
        assert!(scheduler.get_scheduled_to_run(account, horizon, None).unwrap().is_empty());
        assert!(!scheduler.delete_recurring(account, id).unwrap());
    }

    #[test]
    fn recurring_creation_is_not_deduplicated() {
        let scheduler = scheduler();
        let account = AccountId::new();
        for _ in 0..2 {
            scheduler
                .schedule_at_interval(account, "Digest", Workload::new(), IntervalUnit::Week, 1)
                .unwrap();
        }
        assert_eq!(scheduler.find_recurring(account, "Digest").unwrap().len(), 2);
    }

    #[test]
    fn purge_executed_keeps_pending_jobs() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let now = Utc::now();
        scheduler.schedule_at_time(account, "A", now, Workload::new()).unwrap();
        scheduler.schedule_at_time(account, "B", now, Workload::new()).unwrap();

        let due = scheduler.get_scheduled_to_run(account, now, Some("A")).unwrap();
        scheduler.set_job_as_executed(&due[0]).unwrap();

        let purged = scheduler
            .purge_executed(account, Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(scheduler.get_scheduled_to_run(account, now, None).unwrap().len(), 1);
    }

    #[test]
    fn work_scheduler_impl_persists_one_shot() {
        let scheduler = scheduler();
        let account = AccountId::new();
        let t = Utc::now();

        let id = WorkScheduler::schedule_work(&scheduler, account, "Test", Workload::new(), t).unwrap();
        let stored = scheduler.get_scheduled_job(account, id).unwrap().unwrap();
        assert_eq!(stored.worker_name, "Test");
        assert_eq!(stored.execute_time, t);
    }
}
