//! Postgres persistence for scheduled and recurring jobs.

mod scheduler_store;

pub use scheduler_store::{PostgresSchedulerStore, SCHEMA_SQL};
