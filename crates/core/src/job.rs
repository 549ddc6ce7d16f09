//! Job and workload types.
//!
//! A [`Job`] is what crosses the queue boundary: a worker name plus a JSON
//! object workload. Nothing else (no in-memory references) travels with it.

use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{WorkerError, WorkerResult};
use crate::id::AccountId;

/// Workload key carrying the tenant scope.
pub const ACCOUNT_ID_KEY: &str = "account_id";

/// Arguments for a worker: a JSON object with string keys.
///
/// Producers build it with [`Workload::with`] or [`Workload::encode`];
/// workers validate it with [`Workload::decode`] into their own argument
/// struct so a missing key fails with [`WorkerError::InvalidArgument`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workload(Map<String, Value>);

impl Workload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an arbitrary JSON value. Only objects are accepted.
    pub fn from_value(value: Value) -> WorkerResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(WorkerError::invalid_argument(format!(
                "workload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a UTF-8 JSON document (the wire format).
    pub fn from_json(json: &str) -> WorkerResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| WorkerError::invalid_argument(format!("workload is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Serialize a typed argument struct into a workload.
    pub fn encode<T: Serialize>(args: &T) -> WorkerResult<Self> {
        let value = serde_json::to_value(args)
            .map_err(|e| WorkerError::invalid_argument(format!("workload encode: {e}")))?;
        Self::from_value(value)
    }

    /// Deserialize into a typed argument struct, validating required keys.
    pub fn decode<T: DeserializeOwned>(&self) -> WorkerResult<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| WorkerError::invalid_argument(format!("workload: {e}")))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` into `self`; keys in `other` win.
    pub fn merge(&mut self, other: &Workload) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn require_str(&self, key: &str) -> WorkerResult<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(other) if !other.is_null() => Err(WorkerError::invalid_argument(format!(
                "`{key}` must be a non-empty string, got {}",
                json_kind(other)
            ))),
            _ => Err(WorkerError::invalid_argument(format!("`{key}` is required"))),
        }
    }

    pub fn require_i64(&self, key: &str) -> WorkerResult<i64> {
        match self.0.get(key) {
            Some(v) => v.as_i64().ok_or_else(|| {
                WorkerError::invalid_argument(format!("`{key}` must be an integer, got {}", json_kind(v)))
            }),
            None => Err(WorkerError::invalid_argument(format!("`{key}` is required"))),
        }
    }

    /// The tenant this workload belongs to.
    pub fn account_id(&self) -> WorkerResult<AccountId> {
        self.require_str(ACCOUNT_ID_KEY)?.parse()
    }

    pub fn set_account_id(&mut self, account_id: AccountId) {
        self.0
            .insert(ACCOUNT_ID_KEY.to_string(), Value::String(account_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Workload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Workload {
    type Error = WorkerError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Progress of a long-running job (`numerator` out of `denominator`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub numerator: u64,
    pub denominator: u64,
}

impl Progress {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Completed fraction in `0.0..=1.0`, or `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.denominator == 0 {
            return None;
        }
        Some((self.numerator as f64 / self.denominator as f64).min(1.0))
    }
}

/// Last progress a worker reported; serialized as a plain `Option<Progress>`.
#[derive(Debug, Default)]
struct ProgressCell(Mutex<Option<Progress>>);

impl ProgressCell {
    fn get(&self) -> Option<Progress> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, progress: Progress) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(progress);
    }

    fn is_unset(&self) -> bool {
        self.get().is_none()
    }
}

impl From<Option<Progress>> for ProgressCell {
    fn from(progress: Option<Progress>) -> Self {
        Self(Mutex::new(progress))
    }
}

impl Clone for ProgressCell {
    fn clone(&self) -> Self {
        self.get().into()
    }
}

impl PartialEq for ProgressCell {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Serialize for ProgressCell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProgressCell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<Progress>::deserialize(deserializer).map(Self::from)
    }
}

/// One unit of work: the registered worker name plus its workload.
///
/// Workers receive `&Job` and may call [`Job::report_progress`] while they
/// run; the queue reads the last report back once the worker returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    target: String,
    workload: Workload,
    #[serde(default, skip_serializing_if = "ProgressCell::is_unset")]
    progress: ProgressCell,
}

impl Job {
    pub fn new(target: impl Into<String>, workload: Workload) -> Self {
        Self {
            target: target.into(),
            workload,
            progress: ProgressCell::default(),
        }
    }

    pub fn with_progress(self, progress: Progress) -> Self {
        self.progress.set(progress);
        self
    }

    /// Name of the worker this job is addressed to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Record how far the job has got. Later reports replace earlier ones.
    pub fn report_progress(&self, numerator: u64, denominator: u64) {
        self.progress.set(Progress::new(numerator, denominator));
    }

    pub fn progress(&self) -> Option<Progress> {
        self.progress.get()
    }

    pub fn into_workload(self) -> Workload {
        self.workload
    }
}
