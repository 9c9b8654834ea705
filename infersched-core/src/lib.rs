//! InferSched core library
//!
//! Priority-based batching scheduler core for inference serving: bounded
//! per-priority queues with per-request deadlines, and incremental
//! pending-batch assembly that enforces shape compatibility (including
//! shape-tensor contents) across every payload grouped together.
//!
//! The crate deliberately stops at the scheduling boundary. Request data
//! carriers, transports and the model runner are collaborators reached
//! through the [`Request`] trait, the [`ShapeTensorPeek`] callback and the
//! batch sink of [`BatchScheduler`].

pub mod batch;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod shape;
pub mod timers;

#[cfg(test)]
pub(crate) mod test_util;

pub use batch::{fill, take_payloads, BatchHandoff, FillOutcome, PendingBatch};
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use policy::{QueuePolicy, QueuePolicyMap, TimeoutAction};
pub use queue::{EnqueueReject, PolicyQueue, PriorityQueue};
pub use request::{CompletionSink, InputSpec, Payload, Request};
pub use scheduler::{BatchScheduler, BatchSink};
pub use shape::{
    compare_with_pending, init_pending_shape, PendingBatchShapes, PendingShape, ShapeTensorPeek,
};
pub use timers::{now_monotonic_ns, RequestTimers, TimestampKind};
