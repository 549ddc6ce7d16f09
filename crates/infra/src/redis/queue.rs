//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per worker**: `<prefix>:<worker_name>`
//! - **Consumer group**: `workers`, shared by every consumer process
//! - **Consumer**: unique name per process (configurable so a restarted
//!   process can recover its own pending entries)
//! - **Dead-letter stream**: `<prefix>:dlq`
//! - **RPC replies**: list `<prefix>:reply:<uuid>`, pushed once, with expiry
//!
//! Entry fields: `target`, `workload` (UTF-8 JSON), optional `reply_to`.
//! The background handle is the stream entry id.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use redis::Commands;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadOptions,
    StreamReadReply,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use workerman_core::{Job, Progress, Worker, WorkerError, WorkerResult, Workload};
use workerman_queue::{JobHandle, Listeners, Queue, QueueError};

/// Consumer group shared by all worker processes.
pub const CONSUMER_GROUP: &str = "workers";

const DEFAULT_STREAM_PREFIX: &str = "workerman";
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DELIVERIES: u32 = 5;
const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(300);

/// Entries inspected per XPENDING scan when looking for pending work.
const PENDING_SCAN: usize = 10;

/// An entry delivered `times_delivered` times may not be delivered again.
fn over_delivery_limit(times_delivered: usize, max_deliveries: u32) -> bool {
    times_delivered >= max_deliveries as usize
}

/// Another consumer's entry that has sat unacknowledged for `min_idle_ms`.
fn is_stale(owner: &str, idle_ms: usize, consumer: &str, min_idle_ms: usize) -> bool {
    owner != consumer && idle_ms >= min_idle_ms
}

#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<RedisQueueError> for QueueError {
    fn from(err: RedisQueueError) -> Self {
        match err {
            RedisQueueError::Serialization(msg) => QueueError::Serialization(msg),
            other => QueueError::Transport(other.to_string()),
        }
    }
}

/// Redis Streams queue settings.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub stream_prefix: String,
    pub consumer_name: String,
    /// How long `do_work` waits for a reply.
    pub rpc_timeout: Duration,
    /// Idle time after which another consumer's entry may be claimed.
    pub pending_timeout: Duration,
    /// Deliveries after which an entry is dead-lettered.
    pub max_deliveries: u32,
    pub reply_ttl: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            reply_ttl: DEFAULT_REPLY_TTL,
        }
    }
}

/// Reply pushed to the caller of a synchronous job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum RpcReply {
    Ok {
        ok: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<Progress>,
    },
    Error {
        error: String,
        #[serde(default)]
        kind: Option<String>,
    },
}

impl RpcReply {
    fn from_result(result: &WorkerResult<Value>, progress: Option<Progress>) -> Self {
        match result {
            Ok(value) => RpcReply::Ok {
                ok: value.clone(),
                progress,
            },
            Err(e) => {
                let (kind, msg) = match e {
                    WorkerError::InvalidArgument(msg) => ("invalid_argument", msg),
                    WorkerError::Failed(msg) => ("failed", msg),
                    WorkerError::Unavailable(msg) => ("unavailable", msg),
                };
                RpcReply::Error {
                    error: msg.clone(),
                    kind: Some(kind.to_string()),
                }
            }
        }
    }

    fn into_result(self) -> Result<Value, QueueError> {
        match self {
            RpcReply::Ok { ok, .. } => Ok(ok),
            RpcReply::Error { error, kind } => Err(QueueError::from(match kind.as_deref() {
                Some("invalid_argument") => WorkerError::InvalidArgument(error),
                Some("unavailable") => WorkerError::Unavailable(error),
                _ => WorkerError::Failed(error),
            })),
        }
    }
}

/// Job queue over Redis Streams.
#[derive(Debug)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    config: RedisQueueConfig,
    listeners: Listeners,
    cursor: AtomicUsize,
}

impl RedisStreamsQueue {
    pub fn new(redis_url: impl AsRef<str>, config: RedisQueueConfig) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisQueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            config,
            listeners: Listeners::new(),
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    pub fn stream_key(&self, worker_name: &str) -> String {
        format!("{}:{}", self.config.stream_prefix, worker_name)
    }

    pub fn dlq_key(&self) -> String {
        format!("{}:dlq", self.config.stream_prefix)
    }

    fn reply_key(&self) -> String {
        format!("{}:reply:{}", self.config.stream_prefix, uuid::Uuid::now_v7())
    }

    fn connection(&self) -> Result<redis::Connection, RedisQueueError> {
        self.client
            .get_connection()
            .map_err(|e| RedisQueueError::Connection(e.to_string()))
    }

    /// Create the consumer group for a worker stream (idempotent).
    fn ensure_consumer_group(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
    ) -> Result<(), RedisQueueError> {
        // "0": entries added before the group existed are delivered too.
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream_key, CONSUMER_GROUP, "0");
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisQueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    #[instrument(skip(self, conn, workload), fields(stream_key = %self.stream_key(worker_name)), err)]
    fn enqueue(
        &self,
        conn: &mut redis::Connection,
        worker_name: &str,
        workload: &Workload,
        reply_to: Option<&str>,
    ) -> Result<String, RedisQueueError> {
        let payload = workload.to_json();
        let mut items: Vec<(&str, &str)> = vec![("target", worker_name), ("workload", &payload)];
        if let Some(reply_to) = reply_to {
            items.push(("reply_to", reply_to));
        }

        conn.xadd(self.stream_key(worker_name), "*", items.as_slice())
            .map_err(|e| RedisQueueError::Command(format!("XADD failed: {e}")))
    }

    /// Next entry for `worker_name`: own pending entries first, then stale
    /// entries of other consumers, then new entries.
    ///
    /// Pending entries are re-claimed rather than re-read so every retry
    /// bumps the delivery count and a poison entry reaches the dead-letter
    /// stream even when the consumer name never changes.
    fn next_entry(
        &self,
        conn: &mut redis::Connection,
        worker_name: &str,
    ) -> Result<Option<StreamId>, RedisQueueError> {
        let stream_key = self.stream_key(worker_name);
        let consumer = &self.config.consumer_name;

        let own: StreamPendingCountReply = conn
            .xpending_consumer_count(&stream_key, CONSUMER_GROUP, "-", "+", PENDING_SCAN, consumer)
            .map_err(|e| RedisQueueError::Command(format!("XPENDING failed: {e}")))?;
        if let Some(entry) = self.claim_first(conn, &stream_key, own.ids.iter(), 0)? {
            return Ok(Some(entry));
        }

        let pending: StreamPendingCountReply = conn
            .xpending_count(&stream_key, CONSUMER_GROUP, "-", "+", PENDING_SCAN)
            .map_err(|e| RedisQueueError::Command(format!("XPENDING failed: {e}")))?;
        let min_idle = self.config.pending_timeout.as_millis() as usize;
        let stale = pending
            .ids
            .iter()
            .filter(|p| is_stale(&p.consumer, p.last_delivered_ms, consumer, min_idle));
        if let Some(entry) = self.claim_first(conn, &stream_key, stale, min_idle)? {
            return Ok(Some(entry));
        }

        self.read_group(conn, &stream_key, ">")
    }

    fn read_group(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        id: &str,
    ) -> Result<Option<StreamId>, RedisQueueError> {
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.config.consumer_name)
            .count(1);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream_key], &[id], &options)
            .map_err(|e| RedisQueueError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// Claim the first candidate still pending. Entries over the delivery
    /// limit are dead-lettered on the way.
    fn claim_first<'a>(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        candidates: impl Iterator<Item = &'a StreamPendingId>,
        min_idle_ms: usize,
    ) -> Result<Option<StreamId>, RedisQueueError> {
        for pending in candidates {
            let claimed: StreamClaimReply = conn
                .xclaim(
                    stream_key,
                    CONSUMER_GROUP,
                    &self.config.consumer_name,
                    min_idle_ms,
                    &[&pending.id],
                )
                .map_err(|e| RedisQueueError::Command(format!("XCLAIM failed: {e}")))?;

            let Some(entry) = claimed.ids.into_iter().next() else {
                // Someone else claimed it first.
                continue;
            };

            if over_delivery_limit(pending.times_delivered, self.config.max_deliveries) {
                self.dead_letter(conn, stream_key, &entry, pending.times_delivered)?;
                continue;
            }

            debug!(
                stream_key = %stream_key,
                entry_id = %entry.id,
                from = %pending.consumer,
                deliveries = pending.times_delivered + 1,
                "claimed pending entry"
            );
            return Ok(Some(entry));
        }

        Ok(None)
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        entry: &StreamId,
        deliveries: usize,
    ) -> Result<(), RedisQueueError> {
        let target: String = entry.get("target").unwrap_or_default();
        let workload: String = entry.get("workload").unwrap_or_default();
        let deliveries = deliveries.to_string();
        let failed_at = chrono::Utc::now().to_rfc3339();

        let _: String = conn
            .xadd(
                self.dlq_key(),
                "*",
                &[
                    ("stream", stream_key),
                    ("entry_id", entry.id.as_str()),
                    ("target", target.as_str()),
                    ("workload", workload.as_str()),
                    ("deliveries", deliveries.as_str()),
                    ("failed_at", failed_at.as_str()),
                ],
            )
            .map_err(|e| RedisQueueError::Command(format!("DLQ XADD failed: {e}")))?;
        self.acknowledge(conn, stream_key, &entry.id)?;

        warn!(
            stream_key = %stream_key,
            entry_id = %entry.id,
            deliveries = %deliveries,
            "entry moved to dead-letter stream"
        );
        Ok(())
    }

    fn acknowledge(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        entry_id: &str,
    ) -> Result<(), RedisQueueError> {
        let _: i64 = conn
            .xack(stream_key, CONSUMER_GROUP, &[entry_id])
            .map_err(|e| RedisQueueError::Command(format!("XACK failed: {e}")))?;
        let _: i64 = conn
            .xdel(stream_key, &[entry_id])
            .map_err(|e| RedisQueueError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    /// Run one entry, reply if it is an RPC, then acknowledge it.
    fn run_entry(
        &self,
        conn: &mut redis::Connection,
        worker_name: &str,
        worker: &dyn Worker,
        entry: &StreamId,
    ) -> Result<(), RedisQueueError> {
        let stream_key = self.stream_key(worker_name);
        let target: String = entry.get("target").unwrap_or_else(|| worker_name.to_string());
        let payload: Option<String> = entry.get("workload");
        let reply_to: Option<String> = entry.get("reply_to");

        let mut progress = None;
        let result = payload
            .as_deref()
            .ok_or_else(|| WorkerError::invalid_argument("entry has no workload"))
            .and_then(Workload::from_json)
            .and_then(|workload| {
                let job = Job::new(target, workload);
                let result = worker.execute(&job);
                progress = job.progress();
                result
            });

        match &result {
            Ok(_) => debug!(entry_id = %entry.id, worker = %worker_name, ?progress, "job completed"),
            Err(e) => warn!(
                entry_id = %entry.id,
                worker = %worker_name,
                ?progress,
                error = %e,
                "job failed"
            ),
        }

        if let Some(reply_to) = reply_to {
            self.reply(conn, &reply_to, &RpcReply::from_result(&result, progress))?;
        }

        self.acknowledge(conn, &stream_key, &entry.id)
    }

    fn reply(
        &self,
        conn: &mut redis::Connection,
        reply_to: &str,
        reply: &RpcReply,
    ) -> Result<(), RedisQueueError> {
        let reply =
            serde_json::to_string(reply).map_err(|e| RedisQueueError::Serialization(e.to_string()))?;
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(reply_to)
            .arg(reply)
            .ignore()
            .cmd("EXPIRE")
            .arg(reply_to)
            .arg(self.config.reply_ttl.as_secs().max(1))
            .ignore()
            .query::<()>(conn)
            .map_err(|e| RedisQueueError::Command(format!("reply push failed: {e}")))
    }
}

impl Queue for RedisStreamsQueue {
    #[instrument(skip(self, workload), fields(rpc_timeout_ms = self.config.rpc_timeout.as_millis() as u64), err)]
    fn do_work(&self, worker_name: &str, workload: Workload) -> Result<Value, QueueError> {
        let mut conn = self.connection().map_err(|e| QueueError::Enqueue(e.to_string()))?;
        let reply_key = self.reply_key();
        self.enqueue(&mut conn, worker_name, &workload, Some(&reply_key))
            .map_err(|e| QueueError::Enqueue(e.to_string()))?;

        let timeout_secs = self.config.rpc_timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&reply_key)
            .arg(timeout_secs)
            .query(&mut conn)
            .map_err(|e| QueueError::Transport(format!("BLPOP failed: {e}")))?;

        let Some((_, reply)) = popped else {
            return Err(QueueError::Timeout {
                worker_name: worker_name.to_string(),
                timeout: self.config.rpc_timeout,
            });
        };

        let reply: RpcReply =
            serde_json::from_str(&reply).map_err(|e| QueueError::Serialization(e.to_string()))?;
        if let RpcReply::Ok {
            progress: Some(progress),
            ..
        } = &reply
        {
            debug!(worker = %worker_name, ?progress, "job reported progress");
        }
        reply.into_result()
    }

    #[instrument(skip(self, workload), err)]
    fn do_work_background(
        &self,
        worker_name: &str,
        workload: Workload,
    ) -> Result<JobHandle, QueueError> {
        let mut conn = self.connection().map_err(|e| QueueError::Enqueue(e.to_string()))?;
        let entry_id = self
            .enqueue(&mut conn, worker_name, &workload, None)
            .map_err(|e| QueueError::Enqueue(e.to_string()))?;
        Ok(JobHandle::new(entry_id))
    }

    fn add_worker(&self, worker_name: &str, worker: Arc<dyn Worker>) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        self.ensure_consumer_group(&mut conn, &self.stream_key(worker_name))?;
        self.listeners.insert(worker_name, worker);
        debug!(worker = %worker_name, consumer = %self.config.consumer_name, "worker registered");
        Ok(())
    }

    fn workers(&self) -> Vec<String> {
        self.listeners.names()
    }

    fn dispatch_jobs(&self) -> Result<bool, QueueError> {
        let names = self.listeners.names();
        if names.is_empty() {
            return Ok(false);
        }

        let mut conn = self.connection()?;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..names.len() {
            let name = &names[(start + offset) % names.len()];
            let Some(worker) = self.listeners.get(name) else {
                continue;
            };
            let Some(entry) = self.next_entry(&mut conn, name)? else {
                continue;
            };

            if let Err(e) = self.run_entry(&mut conn, name, worker.as_ref(), &entry) {
                // The entry stays pending and is redelivered.
                error!(entry_id = %entry.id, worker = %name, error = %e, "failed to settle entry");
                return Err(e.into());
            }
            return Ok(true);
        }

        Ok(false)
    }

    /// Drain only `worker_name`'s stream. Entries another consumer is still
    /// running (not yet stale) are left to it.
    fn clear_worker_queue(&self, worker_name: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        let stream_key = self.stream_key(worker_name);
        self.ensure_consumer_group(&mut conn, &stream_key)?;

        let mut purged = 0;
        while let Some(entry) = self.next_entry(&mut conn, worker_name)? {
            if let Some(reply_to) = entry.get::<String>("reply_to") {
                let cleared: WorkerResult<Value> = Err(WorkerError::Unavailable(format!(
                    "queue for `{worker_name}` was cleared"
                )));
                self.reply(&mut conn, &reply_to, &RpcReply::from_result(&cleared, None))?;
            }
            self.acknowledge(&mut conn, &stream_key, &entry.id)?;
            purged += 1;
        }

        debug!(worker = %worker_name, purged, "worker queue cleared");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_layout() {
        let queue = RedisStreamsQueue::new(
            "redis://127.0.0.1:6379",
            RedisQueueConfig {
                stream_prefix: "wm".to_string(),
                ..RedisQueueConfig::default()
            },
        )
        .unwrap();

        assert_eq!(queue.stream_key("Test"), "wm:Test");
        assert_eq!(queue.dlq_key(), "wm:dlq");
        assert!(queue.reply_key().starts_with("wm:reply:"));
        assert!(queue.workers().is_empty());
    }

    #[test]
    fn default_consumer_names_are_unique() {
        let a = RedisQueueConfig::default();
        let b = RedisQueueConfig::default();
        assert_ne!(a.consumer_name, b.consumer_name);
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisStreamsQueue::new("not a url", RedisQueueConfig::default()).unwrap_err();
        assert!(matches!(err, RedisQueueError::Connection(_)));
    }

    #[test]
    fn rpc_reply_wire_format() {
        let ok = RpcReply::from_result(&Ok(json!("cba")), None);
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"ok": "cba"}));

        let err = RpcReply::from_result(
            &Err(WorkerError::invalid_argument("`mystring` is required")),
            Some(Progress::new(1, 2)),
        );
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["error"], "`mystring` is required");

        let back: RpcReply = serde_json::from_value(wire).unwrap();
        assert!(matches!(
            back.into_result(),
            Err(QueueError::Worker(WorkerError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn rpc_reply_carries_final_progress() {
        let ok = RpcReply::from_result(&Ok(json!("cba")), Some(Progress::new(3, 3)));
        let wire = serde_json::to_value(&ok).unwrap();
        assert_eq!(
            wire,
            json!({"ok": "cba", "progress": {"numerator": 3, "denominator": 3}})
        );

        let back: RpcReply = serde_json::from_value(wire).unwrap();
        assert_eq!(back, ok);
        assert_eq!(back.into_result().unwrap(), json!("cba"));
    }

    #[test]
    fn poison_entries_hit_the_delivery_limit() {
        assert!(!over_delivery_limit(0, 5));
        assert!(!over_delivery_limit(4, 5));
        assert!(over_delivery_limit(5, 5));
        assert!(over_delivery_limit(9, 5));

        // First delivery comes from `>`; every retry re-claims from the
        // pending list and adds one, so a poison entry runs at most
        // `max_deliveries` times before it is dead-lettered.
        let retries = (1..)
            .take_while(|&delivered| !over_delivery_limit(delivered, DEFAULT_MAX_DELIVERIES))
            .count();
        assert_eq!(1 + retries, DEFAULT_MAX_DELIVERIES as usize);
    }

    #[test]
    fn only_idle_entries_of_other_consumers_are_stale() {
        assert!(is_stale("node-2", 60_000, "node-1", 60_000));
        assert!(!is_stale("node-2", 59_999, "node-1", 60_000));
        assert!(!is_stale("node-1", 600_000, "node-1", 60_000));
    }

    #[test]
    fn bare_error_reply_is_a_worker_failure() {
        let reply: RpcReply = serde_json::from_value(json!({"error": "boom"})).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(QueueError::Worker(WorkerError::Failed(msg))) if msg == "boom"
        ));
    }

    #[test]
    fn transport_errors_map_to_queue_errors() {
        let err: QueueError = RedisQueueError::Command("XADD failed".into()).into();
        assert!(matches!(err, QueueError::Transport(_)));
        let err: QueueError = RedisQueueError::Serialization("bad".into()).into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
