//! Shape compatibility across a pending batch.
//!
//! Payloads batched together must agree on the declared dims of every
//! enforced input. For *shape tensors* the tensor contents influence model
//! dispatch too, so the contents must match as well. Reading those contents
//! may require a copy out of device memory, which is the runner's business;
//! the scheduler goes through the [`ShapeTensorPeek`] callback it was given
//! and never touches tensor data itself.

use std::collections::HashMap;

use crate::error::SchedulerError;
use crate::request::{InputSpec, Request};

/// Reads the contents of a shape-tensor input out of the runner.
///
/// The runner id routes the read in multi-runner deployments. The call may
/// block on device synchronization, so the scheduler invokes it without
/// holding its queue lock.
pub type ShapeTensorPeek =
    dyn Fn(i64, &InputSpec, &dyn Request) -> Result<Vec<i64>, SchedulerError> + Send + Sync;

/// Dims and, for shape tensors, contents recorded for one enforced input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingShape {
    /// Declared dims of the input.
    pub dims: Vec<i64>,
    /// Shape-tensor contents; `None` for ordinary inputs.
    pub contents: Option<Vec<i64>>,
}

/// Shapes recorded from the first payload of a pending batch, keyed by
/// input name.
pub type PendingBatchShapes = HashMap<String, PendingShape>;

/// Record the shapes a new pending batch will enforce, taken from its first
/// payload.
///
/// `enforce_equal` maps each enforced input name to whether it is a shape
/// tensor. For shape tensors the contents are read through `peek`; a failed
/// peek propagates so the caller can fail the payload.
pub fn init_pending_shape(
    runner_id: i64,
    request: &dyn Request,
    enforce_equal: &HashMap<String, bool>,
    peek: &ShapeTensorPeek,
) -> Result<PendingBatchShapes, SchedulerError> {
    let mut shapes = PendingBatchShapes::new();
    for input in request.inputs() {
        if let Some(&is_shape_tensor) = enforce_equal.get(&input.name) {
            let contents = if is_shape_tensor {
                Some(peek(runner_id, input, request)?)
            } else {
                None
            };
            shapes.insert(
                input.name.clone(),
                PendingShape { dims: input.dims.clone(), contents },
            );
        }
    }
    Ok(shapes)
}

/// Whether a candidate request is shape-compatible with the pending batch.
///
/// Dims must match element-wise for every recorded input. When the record
/// carries shape-tensor contents, the candidate's contents must be readable
/// and equal; a failed peek conservatively counts as a mismatch, leaving
/// the candidate queued for a later attempt.
pub fn compare_with_pending(
    runner_id: i64,
    request: &dyn Request,
    peek: &ShapeTensorPeek,
    pending: &PendingBatchShapes,
) -> bool {
    for input in request.inputs() {
        if let Some(recorded) = pending.get(&input.name) {
            if recorded.dims != input.dims {
                return false;
            }
            if let Some(expected) = &recorded.contents {
                match peek(runner_id, input, request) {
                    Ok(contents) if &contents == expected => {}
                    _ => return false,
                }
            }
        }
    }
    true
}
