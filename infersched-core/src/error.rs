//! Error types for the scheduler core.

use thiserror::Error;

/// Errors surfaced by the batching scheduler.
///
/// `QueueFull`, `TimedOut` and `ShuttingDown` are service conditions: the
/// request could not be admitted, or aged out under its level policy.
/// `Internal` indicates a violated precondition and is a bug, not a runtime
/// condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The target priority level is at capacity.
    #[error("Exceeds maximum queue size")]
    QueueFull,

    /// The request deadline elapsed while queued under a `Reject` policy.
    #[error("request timed out awaiting dispatch")]
    TimedOut,

    /// The scheduler is stopping; queued payloads are drained with this
    /// error and further enqueues are refused.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Shape-tensor contents could not be read back from the runner.
    #[error("shape tensor peek failed: {0}")]
    PeekFailed(String),

    /// Violated precondition inside the scheduler.
    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Create a peek failure error
    pub fn peek(msg: impl Into<String>) -> Self {
        Self::PeekFailed(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a service condition rather than a bug.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::TimedOut | Self::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::QueueFull;
        assert_eq!(err.to_string(), "Exceeds maximum queue size");

        let err = SchedulerError::peek("device sync failed");
        assert_eq!(err.to_string(), "shape tensor peek failed: device sync failed");

        let err = SchedulerError::internal("dequeue on empty queue");
        assert_eq!(err.to_string(), "internal scheduler error: dequeue on empty queue");
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(SchedulerError::QueueFull.is_unavailable());
        assert!(SchedulerError::TimedOut.is_unavailable());
        assert!(SchedulerError::ShuttingDown.is_unavailable());
        assert!(!SchedulerError::internal("bug").is_unavailable());
        assert!(!SchedulerError::peek("io").is_unavailable());
    }
}
