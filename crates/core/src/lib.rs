//! `workerman-core`: job and worker building blocks.
//!
//! This crate contains the transport-independent primitives shared by the
//! queue, scheduler and infrastructure crates (no IO).

pub mod error;
pub mod id;
pub mod job;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use id::{AccountId, RecurringJobId, ScheduledJobId};
pub use job::{Job, Progress, Workload};
pub use worker::{FnWorker, Worker};
