//! Process-wide logging setup shared by the WorkerMan binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, init};
