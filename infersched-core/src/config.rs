//! Scheduler configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{QueuePolicy, QueuePolicyMap};

/// Configuration for a [`BatchScheduler`](crate::scheduler::BatchScheduler)
/// and the priority queue underneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of priority levels. 0 = a single flat level.
    pub priority_levels: u32,

    /// Policy applied to every level without an explicit override.
    pub default_policy: QueuePolicy,

    /// Per-level policy overrides.
    pub policy_overrides: QueuePolicyMap,

    /// Preferred payload count per dispatched batch.
    pub max_preferred_batch_size: u64,

    /// How long the dispatcher may hold a non-full batch hoping for more
    /// compatible payloads. A batch is released early when the closest
    /// admitted deadline falls inside this budget.
    pub max_queue_delay: Duration,

    /// Inputs whose shapes must match across a batch, mapped to whether the
    /// input is a shape tensor (contents compared too).
    pub enforce_equal_shapes: HashMap<String, bool>,

    /// Runner identifier passed through to shape-tensor peeks.
    pub runner_id: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_levels: 0,
            default_policy: QueuePolicy::default(),
            policy_overrides: QueuePolicyMap::new(),
            max_preferred_batch_size: 8,
            max_queue_delay: Duration::from_millis(5),
            enforce_equal_shapes: HashMap::new(),
            runner_id: 0,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables, starting from the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("INFERSCHED_PRIORITY_LEVELS") {
            if let Ok(n) = val.parse() {
                config.priority_levels = n;
            }
        }

        if let Ok(val) = std::env::var("INFERSCHED_MAX_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                config.max_preferred_batch_size = n;
            }
        }

        if let Ok(val) = std::env::var("INFERSCHED_QUEUE_DELAY_US") {
            if let Ok(n) = val.parse() {
                config.max_queue_delay = Duration::from_micros(n);
            }
        }

        if let Ok(val) = std::env::var("INFERSCHED_MAX_QUEUE_SIZE") {
            if let Ok(n) = val.parse() {
                config.default_policy.max_queue_size = n;
            }
        }

        if let Ok(val) = std::env::var("INFERSCHED_DEFAULT_TIMEOUT_US") {
            if let Ok(n) = val.parse() {
                config.default_policy.default_timeout_us = n;
            }
        }

        config
    }
}
