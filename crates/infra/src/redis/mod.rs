//! Redis adapters: the Streams job queue and distributed locks.

mod lock;
mod queue;

pub use lock::RedisLockManager;
pub use queue::{CONSUMER_GROUP, RedisQueueConfig, RedisQueueError, RedisStreamsQueue};
