//! Per-session batch execution: a sequential task queue with exponential
//! backoff retries, and a registry of live event streams that receive the
//! queue's progress.

pub mod backoff;
pub mod batch;
pub mod error;
pub mod queue;
pub mod sessions;
pub mod sink;
pub mod task;

pub use backoff::BackoffPolicy;
pub use batch::{BatchOrchestrator, BatchQuery};
pub use error::EngineError;
pub use queue::{ProgressReporter, QueueState, TaskQueue};
pub use sessions::SessionQueues;
pub use sink::{EmitOutcome, EventSinkRegistry, SinkStream};
pub use task::{QueryTask, ResolvedTask, TaskResult};
