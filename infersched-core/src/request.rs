//! Request payloads and the accessors the scheduler needs from them.
//!
//! The concrete request type (tensors, byte buffers, shared-memory
//! descriptors) lives with the transport layer. The scheduler only reads
//! the declared inputs, the batch size and the optional timeout override,
//! so that is all [`Request`] exposes.

use std::fmt;
use std::sync::Arc;

use crate::error::SchedulerError;
use crate::timers::{RequestTimers, TimestampKind};

/// One declared input of an inference request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    /// Input tensor name.
    pub name: String,
    /// Declared dims of the input.
    pub dims: Vec<i64>,
    /// Datatype string, e.g. `"INT64"`.
    pub datatype: String,
}

impl InputSpec {
    /// Create an input spec with the given name and dims.
    pub fn new(name: impl Into<String>, dims: Vec<i64>, datatype: impl Into<String>) -> Self {
        Self { name: name.into(), dims, datatype: datatype.into() }
    }
}

/// Minimal view of an inference request consumed by the scheduler.
pub trait Request: Send + Sync {
    /// Declared inputs of this request.
    fn inputs(&self) -> &[InputSpec];

    /// Number of inference samples carried by this request.
    fn batch_size(&self) -> u64;

    /// Requested queue-timeout override in microseconds. 0 means unset.
    /// A level policy may honor this only to shorten its default, never to
    /// lengthen it.
    fn timeout_us(&self) -> u64;
}

/// Completion callback invoked exactly once per payload, with `Ok(())` when
/// the payload was handed to a runner and an error when it was rejected.
pub type CompletionSink = Box<dyn FnOnce(Result<(), SchedulerError>) + Send>;

/// An admitted request plus its scheduling bookkeeping.
///
/// Created on enqueue and consumed exactly once: either dispatched as part
/// of a batch or completed with an error.
pub struct Payload {
    request: Arc<dyn Request>,
    timers: RequestTimers,
    sink: Option<CompletionSink>,
}

impl Payload {
    /// Wrap a request and its completion sink for scheduling.
    pub fn new(request: Arc<dyn Request>, sink: CompletionSink) -> Self {
        let mut timers = RequestTimers::new();
        timers.capture(TimestampKind::RequestStart);
        Self { request, timers, sink: Some(sink) }
    }

    /// The wrapped request.
    pub fn request(&self) -> &dyn Request {
        self.request.as_ref()
    }

    /// A shared handle to the request, for use while the queue lock is not
    /// held (shape-tensor peeks may block on device I/O).
    pub fn request_handle(&self) -> Arc<dyn Request> {
        Arc::clone(&self.request)
    }

    /// Batch size of the wrapped request.
    pub fn batch_size(&self) -> u64 {
        self.request.batch_size()
    }

    /// Lifecycle timestamps.
    pub fn timers(&self) -> &RequestTimers {
        &self.timers
    }

    /// Mutable lifecycle timestamps.
    pub fn timers_mut(&mut self) -> &mut RequestTimers {
        &mut self.timers
    }

    /// Invoke the completion sink. The first call consumes the sink;
    /// later calls are no-ops.
    pub fn complete(&mut self, result: Result<(), SchedulerError>) {
        if let Some(sink) = self.sink.take() {
            sink(result);
        }
    }

    /// Whether the completion sink has already been invoked.
    pub fn is_completed(&self) -> bool {
        self.sink.is_none()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("batch_size", &self.request.batch_size())
            .field("timeout_us", &self.request.timeout_us())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
