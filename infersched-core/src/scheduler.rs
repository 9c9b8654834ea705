//! Thread-safe scheduler front-end.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Producer threads                      │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ enqueue(level, request)
//!                    ┌────────▼────────┐
//!                    │  PriorityQueue  │ ← one mutex, one condvar
//!                    │  + cursor       │
//!                    └────────┬────────┘
//!                             │ batch assembly
//!                    ┌────────▼────────┐
//!                    │   Dispatcher    │ ← single worker thread
//!                    └────────┬────────┘
//!                             │ BatchHandoff
//!                    ┌────────▼────────┐
//!                    │  Model runner   │
//!                    └─────────────────┘
//! ```
//!
//! Producers hold the lock only long enough to append to a queue. The
//! dispatcher holds it while mutating the queue or the cursor, but releases
//! it around every shape-tensor peek: a peek may block on device
//! synchronization, and producers must not stall behind it. After a peek
//! the dispatcher re-checks the cursor and restarts assembly if a
//! higher-priority arrival (or an elapsed admitted deadline) invalidated
//! the scan in the meantime.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::batch::{BatchHandoff, PendingBatch};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::queue::PriorityQueue;
use crate::request::{CompletionSink, Payload, Request};
use crate::shape::ShapeTensorPeek;
use crate::timers::{now_monotonic_ns, TimestampKind};

/// Receives assembled batches; the seam where the model runner plugs in.
pub type BatchSink = Box<dyn FnMut(BatchHandoff) + Send>;

/// Priority batching scheduler with a dedicated dispatcher thread.
pub struct BatchScheduler {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    metrics: Arc<SchedulerMetrics>,
}

struct State {
    queue: PriorityQueue,
    shutdown: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcome of inspecting one candidate with the lock released.
enum Verdict {
    Admit,
    Mismatch,
    SeedFailed(SchedulerError),
}

impl BatchScheduler {
    /// Start a scheduler and its dispatcher thread.
    ///
    /// `peek` reads shape-tensor contents out of the runner identified by
    /// `config.runner_id`; `sink` receives every assembled batch.
    pub fn spawn(
        config: SchedulerConfig,
        peek: Arc<ShapeTensorPeek>,
        sink: BatchSink,
    ) -> io::Result<Self> {
        let queue = PriorityQueue::new(
            config.default_policy.clone(),
            config.priority_levels,
            &config.policy_overrides,
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(State { queue, shutdown: false }),
            wake: Condvar::new(),
            metrics: Arc::new(SchedulerMetrics::new()),
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("infersched-dispatcher".into())
                .spawn(move || dispatch_loop(&shared, &config, peek, sink))?
        };

        Ok(Self { shared, dispatcher: Some(dispatcher) })
    }

    /// Admit a request at `level` and wake the dispatcher.
    ///
    /// On refusal the completion sink has already been invoked with the
    /// same error that is returned, so the producer can observe admission
    /// synchronously while the response path stays intact.
    pub fn enqueue(
        &self,
        level: u32,
        request: Arc<dyn Request>,
        sink: CompletionSink,
    ) -> Result<(), SchedulerError> {
        let payload = Payload::new(request, sink);
        let mut state = self.shared.lock();
        if state.shutdown {
            drop(state);
            let mut payload = payload;
            payload.complete(Err(SchedulerError::ShuttingDown));
            return Err(SchedulerError::ShuttingDown);
        }
        match state.queue.enqueue(level, payload) {
            Ok(()) => {
                let depth = state.queue.size();
                drop(state);
                self.shared.metrics.record_enqueued();
                debug!(level, queue_depth = depth, "request enqueued");
                self.shared.wake.notify_one();
                Ok(())
            }
            Err(reject) => {
                drop(state);
                self.shared.metrics.record_rejected_full();
                warn!(level, "request refused: {}", reject.error);
                let mut payload = reject.payload;
                payload.complete(Err(reject.error.clone()));
                Err(reject.error)
            }
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Current admitted payload count across all levels.
    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.size()
    }

    /// Stop the dispatcher and complete every still-queued payload with
    /// [`SchedulerError::ShuttingDown`]. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(
    shared: &Shared,
    config: &SchedulerConfig,
    peek: Arc<ShapeTensorPeek>,
    mut sink: BatchSink,
) {
    let preferred = config.max_preferred_batch_size.max(1) as usize;
    let delay_ns = config.max_queue_delay.as_nanos() as u64;
    let mut batch = PendingBatch::new(config.runner_id, config.enforce_equal_shapes.clone());
    info!(preferred_batch_size = preferred, "dispatcher started");

    let mut state = shared.lock();
    'dispatch: loop {
        while state.queue.is_empty() && !state.shutdown {
            state = shared
                .wake
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.shutdown {
            break;
        }

        // Grow the pending batch. The loop mirrors `batch::fill`, except
        // the lock is released around every candidate inspection.
        if !state.queue.is_cursor_valid() {
            state.queue.reset_cursor();
            batch.clear();
        }
        let mut rejected_batch_size = 0u64;
        let mut sealed = false;
        while state.queue.pending_count() < preferred {
            rejected_batch_size += state.queue.apply_policy_at_cursor();
            let request = match state.queue.candidate() {
                Some(candidate) => candidate.request_handle(),
                None => break,
            };
            let first = state.queue.pending_count() == 0;

            drop(state);
            let verdict = if first {
                match batch.seed(request.as_ref(), peek.as_ref()) {
                    Ok(()) => Verdict::Admit,
                    Err(err) => Verdict::SeedFailed(err),
                }
            } else if batch.matches(request.as_ref(), peek.as_ref()) {
                Verdict::Admit
            } else {
                Verdict::Mismatch
            };
            state = shared.lock();

            if state.shutdown {
                break 'dispatch;
            }
            if state.queue.cursor_interrupted() {
                // The queue changed under the peek; the admitted prefix is
                // no longer trustworthy. Rebuild from the front.
                debug!("cursor invalidated during peek, restarting batch assembly");
                state.queue.reset_cursor();
                batch.clear();
                continue;
            }

            match verdict {
                Verdict::Admit => state.queue.advance_cursor(),
                Verdict::Mismatch => {
                    sealed = true;
                    break;
                }
                Verdict::SeedFailed(err) => {
                    match state.queue.dequeue() {
                        Ok(mut payload) => {
                            shared.metrics.record_drained();
                            drop(state);
                            warn!(error = %err, "failing unreadable payload");
                            payload.complete(Err(err));
                            state = shared.lock();
                        }
                        Err(bug) => error!(error = %bug, "seed failure with no payload to fail"),
                    }
                    state.queue.reset_cursor();
                    batch.clear();
                }
            }
        }
        if state.shutdown {
            break;
        }

        // Complete freshly rejected payloads before deciding on dispatch;
        // their sinks run without the lock.
        let rejected = harvest_rejected(&mut state.queue);
        if !rejected.is_empty() {
            debug!(count = rejected.len(), rejected_batch_size, "rejecting expired payloads");
            drop(state);
            for mut payload in rejected {
                shared.metrics.record_timed_out(payload.batch_size());
                payload.complete(Err(SchedulerError::TimedOut));
            }
            state = shared.lock();
            continue;
        }

        let pending = state.queue.pending_count();
        if pending == 0 {
            // Everything admitted so far expired away; wait for arrivals.
            continue;
        }

        let closest = state.queue.closest_deadline_ns();
        let oldest = state.queue.oldest_enqueue_ns();
        let now = now_monotonic_ns();
        let age_ns = now.saturating_sub(oldest);
        let full = pending >= preferred;
        let deadline_pressure = closest != 0 && closest.saturating_sub(now) <= delay_ns;

        if full || sealed || age_ns >= delay_ns || deadline_pressure {
            let mut payloads = Vec::with_capacity(pending);
            for _ in 0..pending {
                match state.queue.dequeue() {
                    Ok(payload) => payloads.push(payload),
                    Err(bug) => {
                        error!(error = %bug, "pending batch out of sync with queue");
                        break;
                    }
                }
            }
            drop(state);

            let total_wait_ns: u64 = payloads
                .iter()
                .map(|p| now.saturating_sub(p.timers().timestamp(TimestampKind::QueueStart)))
                .sum();
            shared.metrics.record_batch(payloads.len(), total_wait_ns);
            debug!(batch_size = payloads.len(), "dispatching batch");
            sink(BatchHandoff {
                payloads,
                closest_deadline_ns: closest,
                oldest_enqueue_ns: oldest,
            });
            state = shared.lock();
        } else {
            // Hold the batch for stragglers, but never past the delay
            // budget or the closest admitted deadline.
            let mut wait_ns = delay_ns - age_ns;
            if closest != 0 {
                wait_ns = wait_ns.min(closest.saturating_sub(now));
            }
            let (guard, _) = shared
                .wake
                .wait_timeout(state, Duration::from_nanos(wait_ns))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    // Drain whatever is still queued so every sink fires exactly once.
    let mut leftovers = Vec::new();
    while !state.queue.is_empty() {
        match state.queue.dequeue() {
            Ok(payload) => leftovers.push(payload),
            Err(_) => break,
        }
    }
    let rejected = harvest_rejected(&mut state.queue);
    drop(state);

    for mut payload in rejected {
        shared.metrics.record_timed_out(payload.batch_size());
        payload.complete(Err(SchedulerError::TimedOut));
    }
    for mut payload in leftovers {
        shared.metrics.record_drained();
        payload.complete(Err(SchedulerError::ShuttingDown));
    }
    info!("dispatcher stopped");
}

fn harvest_rejected(queue: &mut PriorityQueue) -> Vec<Payload> {
    queue
        .release_rejected_payloads()
        .into_iter()
        .flatten()
        .collect()
}
