//! Metrics for the batching scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for monitoring scheduler behavior.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Total requests admitted to a queue.
    pub requests_enqueued: AtomicU64,

    /// Requests currently waiting in a queue.
    pub requests_queued: AtomicU64,

    /// Requests refused because their level was at capacity.
    pub requests_rejected_full: AtomicU64,

    /// Requests rejected because their deadline elapsed under a `Reject`
    /// policy.
    pub requests_timed_out: AtomicU64,

    /// Accumulated batch size of timed-out requests.
    pub rejected_batch_size: AtomicU64,

    /// Requests handed to the runner as part of a batch.
    pub requests_dispatched: AtomicU64,

    /// Batches handed to the runner.
    pub batches_dispatched: AtomicU64,

    /// Total queue wait of dispatched requests in nanoseconds.
    pub total_queue_wait_ns: AtomicU64,

    /// Maximum queue depth observed.
    pub max_queue_depth: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request entering a queue.
    pub fn record_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::Relaxed);
        let queued = self.requests_queued.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while queued > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                queued,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record a request refused at enqueue time.
    pub fn record_rejected_full(&self) {
        self.requests_rejected_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request rejected on deadline expiry.
    pub fn record_timed_out(&self, batch_size: u64) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
        self.rejected_batch_size.fetch_add(batch_size, Ordering::Relaxed);
    }

    /// Record a dispatched batch and the queue wait of its payloads.
    pub fn record_batch(&self, batch_size: usize, total_wait_ns: u64) {
        self.requests_queued
            .fetch_sub(batch_size as u64, Ordering::Relaxed);
        self.requests_dispatched
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_ns
            .fetch_add(total_wait_ns, Ordering::Relaxed);
    }

    /// Record a queued request drained at shutdown.
    pub fn record_drained(&self) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> u64 {
        self.requests_queued.load(Ordering::Relaxed)
    }

    /// Average queue wait of dispatched requests in milliseconds.
    pub fn avg_queue_wait_ms(&self) -> f64 {
        let dispatched = self.requests_dispatched.load(Ordering::Relaxed);
        if dispatched == 0 {
            return 0.0;
        }
        let total_ns = self.total_queue_wait_ns.load(Ordering::Relaxed);
        total_ns as f64 / dispatched as f64 / 1_000_000.0
    }

    /// Average payload count per dispatched batch.
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_dispatched.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        let dispatched = self.requests_dispatched.load(Ordering::Relaxed);
        dispatched as f64 / batches as f64
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_rejected_full: self.requests_rejected_full.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            rejected_batch_size: self.rejected_batch_size.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            avg_queue_wait_ms: self.avg_queue_wait_ms(),
            avg_batch_size: self.avg_batch_size(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.requests_enqueued.store(0, Ordering::Relaxed);
        self.requests_queued.store(0, Ordering::Relaxed);
        self.requests_rejected_full.store(0, Ordering::Relaxed);
        self.requests_timed_out.store(0, Ordering::Relaxed);
        self.rejected_batch_size.store(0, Ordering::Relaxed);
        self.requests_dispatched.store(0, Ordering::Relaxed);
        self.batches_dispatched.store(0, Ordering::Relaxed);
        self.total_queue_wait_ns.store(0, Ordering::Relaxed);
        self.max_queue_depth.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_enqueued: u64,
    pub requests_queued: u64,
    pub requests_rejected_full: u64,
    pub requests_timed_out: u64,
    pub rejected_batch_size: u64,
    pub requests_dispatched: u64,
    pub batches_dispatched: u64,
    pub max_queue_depth: u64,
    pub avg_queue_wait_ms: f64,
    pub avg_batch_size: f64,
}
