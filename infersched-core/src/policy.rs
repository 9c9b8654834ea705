//! Per-level queueing policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What happens to a request whose deadline elapses while it waits in the
/// main queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutAction {
    /// Complete the request with a timeout error on the next dispatcher pass.
    Reject,
    /// Keep the request runnable, but behind everything still inside its
    /// deadline; it loses its original queue position.
    Delay,
}

/// Queueing policy for one priority level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Maximum payloads admitted at this level. 0 = unbounded.
    pub max_queue_size: u64,

    /// Time a payload may wait before the timeout action fires, in
    /// microseconds. 0 = no deadline.
    pub default_timeout_us: u64,

    /// Whether a request may shorten the default timeout. A request can
    /// never lengthen it.
    pub allow_timeout_override: bool,

    /// Action taken when the deadline elapses.
    pub timeout_action: TimeoutAction,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout_us: 0,
            allow_timeout_override: false,
            timeout_action: TimeoutAction::Reject,
        }
    }
}

impl QueuePolicy {
    /// Effective timeout for a request carrying `override_us` (0 = unset),
    /// in microseconds. The override is honored only when overrides are
    /// allowed and it narrows the default.
    pub fn effective_timeout_us(&self, override_us: u64) -> u64 {
        if self.allow_timeout_override
            && override_us != 0
            && override_us < self.default_timeout_us
        {
            override_us
        } else {
            self.default_timeout_us
        }
    }
}

/// Per-level policy overrides keyed by priority level.
pub type QueuePolicyMap = HashMap<u32, QueuePolicy>;
