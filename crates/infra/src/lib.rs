//! Infrastructure layer: configuration, Redis transport and Postgres storage.
//!
//! Backends are feature-gated:
//! - `redis`: [`redis::RedisStreamsQueue`] and [`redis::RedisLockManager`]
//! - `postgres`: [`postgres::PostgresSchedulerStore`]

pub mod config;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use config::{ConfigError, QueueBackend, WorkerManConfig};
