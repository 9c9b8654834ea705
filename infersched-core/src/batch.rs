//! Pending-batch assembly.
//!
//! The builder grows a candidate batch by walking the priority queue's
//! pending cursor: expired payloads are migrated or rejected on the way,
//! the first admission seeds the batch's shape record, and every later
//! candidate must compare equal against it. Growth stops at the preferred
//! batch size, at the first shape mismatch, or when no candidate remains.

use std::collections::HashMap;

use tracing::debug;

use crate::error::SchedulerError;
use crate::queue::PriorityQueue;
use crate::request::{Payload, Request};
use crate::shape::{compare_with_pending, init_pending_shape, PendingBatchShapes, ShapeTensorPeek};

/// A batch handed to the runner, with the scheduling facts it needs for
/// its own dispatch policy.
#[derive(Debug)]
pub struct BatchHandoff {
    /// Payloads in priority order.
    pub payloads: Vec<Payload>,
    /// Minimum non-zero deadline among the payloads; 0 if none carry one.
    pub closest_deadline_ns: u64,
    /// Minimum queue-entry timestamp among the payloads.
    pub oldest_enqueue_ns: u64,
}

/// Shape state of the batch currently being assembled.
#[derive(Debug)]
pub struct PendingBatch {
    runner_id: i64,
    enforce_equal: HashMap<String, bool>,
    shapes: PendingBatchShapes,
}

impl PendingBatch {
    /// Create an empty pending batch enforcing shape equality on the given
    /// inputs (`true` marks a shape tensor, whose contents must match too).
    pub fn new(runner_id: i64, enforce_equal: HashMap<String, bool>) -> Self {
        Self { runner_id, enforce_equal, shapes: PendingBatchShapes::new() }
    }

    /// Drop the recorded shapes; the next seeded payload starts a new
    /// batch.
    pub fn clear(&mut self) {
        self.shapes.clear();
    }

    /// Record the shapes of the batch's first payload. A peek failure
    /// propagates so the caller can fail that payload.
    pub fn seed(
        &mut self,
        request: &dyn Request,
        peek: &ShapeTensorPeek,
    ) -> Result<(), SchedulerError> {
        self.shapes = init_pending_shape(self.runner_id, request, &self.enforce_equal, peek)?;
        Ok(())
    }

    /// Whether a candidate is shape-compatible with the recorded shapes.
    pub fn matches(&self, request: &dyn Request, peek: &ShapeTensorPeek) -> bool {
        compare_with_pending(self.runner_id, request, peek, &self.shapes)
    }
}

/// Result of one [`fill`] pass.
#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    /// Payloads admitted to the batch.
    pub pending_count: usize,
    /// Minimum non-zero deadline among them; 0 if none.
    pub closest_deadline_ns: u64,
    /// Minimum queue-entry timestamp among them.
    pub oldest_enqueue_ns: u64,
    /// Accumulated batch size of payloads rejected on this pass.
    pub rejected_batch_size: u64,
    /// Whether growth stopped on a shape mismatch. The mismatching
    /// candidate stays queued for a future batch, and no further growth is
    /// possible this cycle.
    pub sealed: bool,
}

/// Grow the pending batch up to `max_batch_size` payloads.
///
/// The caller owns the queue for the duration of the pass; the threaded
/// front-end implements the same loop with the queue lock released around
/// peeks. Payloads whose shape record cannot be seeded (peek failure) are
/// removed and completed with the error.
pub fn fill(
    queue: &mut PriorityQueue,
    batch: &mut PendingBatch,
    peek: &ShapeTensorPeek,
    max_batch_size: usize,
) -> FillOutcome {
    if !queue.is_cursor_valid() {
        queue.reset_cursor();
        batch.clear();
    }

    let mut rejected_batch_size = 0u64;
    let mut sealed = false;
    while queue.pending_count() < max_batch_size {
        rejected_batch_size += queue.apply_policy_at_cursor();

        let request = match queue.candidate() {
            Some(candidate) => candidate.request_handle(),
            None => break,
        };

        if queue.pending_count() == 0 {
            if let Err(err) = batch.seed(request.as_ref(), peek) {
                // The would-be first payload of the batch cannot even be
                // inspected; fail it and start over with the next one.
                debug!(error = %err, "failed to seed pending batch shapes");
                if let Ok(mut payload) = queue.dequeue() {
                    payload.complete(Err(err));
                }
                queue.reset_cursor();
                batch.clear();
                continue;
            }
        } else if !batch.matches(request.as_ref(), peek) {
            sealed = true;
            break;
        }

        queue.advance_cursor();
    }

    FillOutcome {
        pending_count: queue.pending_count(),
        closest_deadline_ns: queue.closest_deadline_ns(),
        oldest_enqueue_ns: queue.oldest_enqueue_ns(),
        rejected_batch_size,
        sealed,
    }
}

/// Pop the first `count` payloads from the queue in priority order.
pub fn take_payloads(
    queue: &mut PriorityQueue,
    count: usize,
) -> Result<Vec<Payload>, SchedulerError> {
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        payloads.push(queue.dequeue()?);
    }
    Ok(payloads)
}
