//! Job queue transports and the worker-facing service.
//!
//! - [`Queue`]: transport abstraction (in-memory here, Redis in `workerman-infra`)
//! - [`WorkerRegistry`]: name → worker factory table built at process start
//! - [`WorkerService`]: façade producers and consumers talk to
//! - [`JobProcessor`]: the consumer dispatch loop

pub mod in_memory;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod service;

pub use in_memory::{DeliveryMode, InMemoryQueue};
pub use processor::{ExitReason, JobProcessor, JobProcessorConfig, ProcessSummary, StopSignal};
pub use queue::{JobHandle, Listeners, Queue, QueueError};
pub use registry::WorkerRegistry;
pub use service::{ScheduleError, WorkScheduler, WorkerService};
