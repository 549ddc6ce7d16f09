//! Scheduled and recurring job records.

use core::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use workerman_core::{AccountId, RecurringJobId, ScheduledJobId, Workload};

/// Calendar unit of a recurring interval.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
            IntervalUnit::Year => "year",
        }
    }

    /// `from + interval * unit`, or `None` on overflow.
    ///
    /// Month and year steps are calendar-aware and clamp to the last day of
    /// the target month (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>, interval: u32) -> Option<DateTime<Utc>> {
        let n = i64::from(interval);
        match self {
            IntervalUnit::Minute => from.checked_add_signed(Duration::try_minutes(n)?),
            IntervalUnit::Hour => from.checked_add_signed(Duration::try_hours(n)?),
            IntervalUnit::Day => from.checked_add_signed(Duration::try_days(n)?),
            IntervalUnit::Week => from.checked_add_signed(Duration::try_weeks(n)?),
            IntervalUnit::Month => from.checked_add_months(Months::new(interval)),
            IntervalUnit::Year => from.checked_add_months(Months::new(interval.checked_mul(12)?)),
        }
    }
}

impl IntervalUnit {
    /// Occurrence `k` of a cadence starting at `origin`: `origin + k * interval`.
    ///
    /// Counting from the origin keeps month-end starts on the last day of
    /// every month instead of drifting to the shortest one seen so far.
    pub fn occurrence(&self, origin: DateTime<Utc>, interval: u32, k: u32) -> Option<DateTime<Utc>> {
        self.advance(origin, interval.checked_mul(k)?)
    }

    /// Length in seconds, for the fixed-length units.
    fn seconds(&self) -> Option<i64> {
        match self {
            IntervalUnit::Minute => Some(60),
            IntervalUnit::Hour => Some(3_600),
            IntervalUnit::Day => Some(86_400),
            IntervalUnit::Week => Some(604_800),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }

    /// Whole intervals from `origin` to `to`; may be one too many for
    /// calendar units.
    fn steps_between(&self, origin: DateTime<Utc>, to: DateTime<Utc>, interval: u32) -> u32 {
        let interval = i64::from(interval);
        let steps = match self.seconds() {
            Some(secs) => (to - origin).num_seconds() / (interval * secs),
            None => {
                let months = i64::from(to.year() - origin.year()) * 12 + i64::from(to.month())
                    - i64::from(origin.month());
                let per_step = if *self == IntervalUnit::Year { 12 } else { 1 };
                months / (interval * per_step)
            }
        };
        u32::try_from(steps.max(0)).unwrap_or(u32::MAX)
    }
}

impl core::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown interval unit name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval unit `{0}`")]
pub struct UnknownIntervalUnit(pub String);

impl FromStr for IntervalUnit {
    type Err = UnknownIntervalUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(IntervalUnit::Minute),
            "hour" => Ok(IntervalUnit::Hour),
            "day" => Ok(IntervalUnit::Day),
            "week" => Ok(IntervalUnit::Week),
            "month" => Ok(IntervalUnit::Month),
            "year" => Ok(IntervalUnit::Year),
            _ => Err(UnknownIntervalUnit(s.to_string())),
        }
    }
}

/// Lifecycle of a scheduled job at a given instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// `execute_time` is still in the future.
    Pending,
    /// Eligible to run.
    Due,
    Executed,
}

/// A persisted one-shot job, or an instance materialized from a
/// [`RecurringJob`] (`recurrence_id` set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Assigned on first save.
    pub id: Option<ScheduledJobId>,
    pub account_id: AccountId,
    pub worker_name: String,
    pub job_data: Workload,
    pub execute_time: DateTime<Utc>,
    pub recurrence_id: Option<RecurringJobId>,
    pub time_executed: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(
        account_id: AccountId,
        worker_name: impl Into<String>,
        job_data: Workload,
        execute_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            account_id,
            worker_name: worker_name.into(),
            job_data,
            execute_time,
            recurrence_id: None,
            time_executed: None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.time_executed.is_some() {
            JobState::Executed
        } else if self.execute_time <= now {
            JobState::Due
        } else {
            JobState::Pending
        }
    }

    pub fn is_executed(&self) -> bool {
        self.time_executed.is_some()
    }

    pub fn is_recurring_instance(&self) -> bool {
        self.recurrence_id.is_some()
    }
}

/// Template describing a repeating cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: Option<RecurringJobId>,
    pub account_id: AccountId,
    pub worker_name: String,
    pub job_data: Workload,
    pub interval_unit: IntervalUnit,
    /// Always positive.
    pub interval: u32,
    /// Execute time of the most recent completed occurrence.
    pub time_last_executed: Option<DateTime<Utc>>,
    /// Execute time of the most recently materialized instance.
    pub time_last_scheduled: Option<DateTime<Utc>>,
    /// First occurrence when nothing has been materialized or run yet.
    pub created_at: DateTime<Utc>,
}

impl RecurringJob {
    pub fn new(
        account_id: AccountId,
        worker_name: impl Into<String>,
        job_data: Workload,
        interval_unit: IntervalUnit,
        interval: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            account_id,
            worker_name: worker_name.into(),
            job_data,
            interval_unit,
            interval,
            time_last_executed: None,
            time_last_scheduled: None,
            created_at,
        }
    }

    /// Point the next occurrence is computed from.
    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.time_last_scheduled.or(self.time_last_executed)
    }

    /// Execute time of the next instance to materialize: the first
    /// occurrence counted from `created_at` that is later than the anchor.
    pub fn next_execute_time(&self) -> Option<DateTime<Utc>> {
        let Some(anchor) = self.anchor() else {
            return Some(self.created_at);
        };
        let occurrence = |k| self.interval_unit.occurrence(self.created_at, self.interval, k);

        let mut k = self.interval_unit.steps_between(self.created_at, anchor, self.interval);
        for _ in 0..2 {
            if k > 0 && occurrence(k).is_none_or(|t| t > anchor) {
                k -= 1;
            }
        }
        loop {
            let t = occurrence(k)?;
            if t > anchor {
                return Some(t);
            }
            k = k.checked_add(1)?;
        }
    }

    /// Build the instance for `execute_time`.
    pub fn instance(&self, execute_time: DateTime<Utc>) -> ScheduledJob {
        let mut job = ScheduledJob::new(
            self.account_id,
            self.worker_name.clone(),
            self.job_data.clone(),
            execute_time,
        );
        job.recurrence_id = self.id;
        job
    }
}
