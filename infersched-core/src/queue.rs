//! Priority queues with per-level timeout policy and the pending-batch
//! cursor.
//!
//! A [`PriorityQueue`] maps priority levels (lower numeric = higher
//! priority) to [`PolicyQueue`]s. Each level keeps three FIFOs: `main`
//! holds payloads still inside their deadline, `delayed` holds payloads
//! whose deadline fired under a [`TimeoutAction::Delay`] policy, and
//! `rejected` holds payloads awaiting failure completion under
//! [`TimeoutAction::Reject`].
//!
//! Batch assembly walks the queue through a *pending cursor* instead of
//! re-scanning from the front on every pass: the cursor remembers how far
//! the scan got and which payloads were already admitted to the candidate
//! batch. Any mutation that could change what belongs at the front of the
//! batch invalidates the cursor.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};

use tracing::{debug, warn};

use crate::error::SchedulerError;
use crate::policy::{QueuePolicy, QueuePolicyMap, TimeoutAction};
use crate::request::Payload;
use crate::timers::{now_monotonic_ns, TimestampKind};

/// An enqueue refusal carrying the payload back to the caller, so its
/// completion sink is never lost.
#[derive(Debug)]
pub struct EnqueueReject {
    /// Why the payload was refused.
    pub error: SchedulerError,
    /// The refused payload, returned unconsumed.
    pub payload: Payload,
}

/// One priority level: a bounded FIFO with deadline policy.
#[derive(Debug)]
pub struct PolicyQueue {
    policy: QueuePolicy,
    main: VecDeque<Payload>,
    /// Absolute monotonic deadline per `main` entry; 0 = none. Always the
    /// same length as `main`.
    deadline_ns: VecDeque<u64>,
    delayed: VecDeque<Payload>,
    rejected: VecDeque<Payload>,
}

impl PolicyQueue {
    /// Create an empty queue governed by `policy`.
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            main: VecDeque::new(),
            deadline_ns: VecDeque::new(),
            delayed: VecDeque::new(),
            rejected: VecDeque::new(),
        }
    }

    /// The policy governing this level.
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Admitted payload count (`main` plus `delayed`).
    pub fn size(&self) -> usize {
        self.main.len() + self.delayed.len()
    }

    /// Whether no admitted payload remains.
    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.delayed.is_empty()
    }

    /// Admit a payload, stamping its queue-entry time and computing its
    /// effective deadline from the level policy and the request's override.
    pub fn enqueue(&mut self, mut payload: Payload) -> Result<(), EnqueueReject> {
        if self.policy.max_queue_size != 0 && self.size() as u64 >= self.policy.max_queue_size {
            return Err(EnqueueReject { error: SchedulerError::QueueFull, payload });
        }

        payload.timers_mut().capture(TimestampKind::QueueStart);
        let timeout_us = self.policy.effective_timeout_us(payload.request().timeout_us());
        let deadline = if timeout_us != 0 {
            now_monotonic_ns().saturating_add(timeout_us.saturating_mul(1000))
        } else {
            0
        };
        self.main.push_back(payload);
        self.deadline_ns.push_back(deadline);
        Ok(())
    }

    /// Remove and return the frontmost admitted payload: `main` first, then
    /// `delayed`. Returns `None` when the queue is empty.
    pub fn dequeue(&mut self) -> Option<Payload> {
        if let Some(payload) = self.main.pop_front() {
            self.deadline_ns.pop_front();
            Some(payload)
        } else {
            self.delayed.pop_front()
        }
    }

    /// Apply the timeout policy to `main` starting at `idx`, migrating or
    /// rejecting every expired entry found there.
    ///
    /// Returns `true` when `idx` ends up on an unexpired `main` entry, or
    /// on a `delayed` entry once `main` is exhausted; `false` when no
    /// payload exists at `idx` at all.
    pub fn apply_policy(
        &mut self,
        idx: usize,
        rejected_count: &mut usize,
        rejected_batch_size: &mut u64,
    ) -> bool {
        let now = now_monotonic_ns();
        while idx < self.main.len() {
            let deadline = self.deadline_ns[idx];
            if deadline == 0 || now <= deadline {
                // Parked on an entry still inside its deadline.
                return true;
            }
            let payload = match self.main.remove(idx) {
                Some(p) => p,
                None => break,
            };
            self.deadline_ns.remove(idx);
            match self.policy.timeout_action {
                TimeoutAction::Delay => {
                    debug!(batch_size = payload.batch_size(), "payload deadline elapsed, delaying");
                    self.delayed.push_back(payload);
                }
                TimeoutAction::Reject => {
                    warn!(batch_size = payload.batch_size(), "payload deadline elapsed, rejecting");
                    *rejected_count += 1;
                    *rejected_batch_size += payload.batch_size();
                    self.rejected.push_back(payload);
                }
            }
        }
        (idx - self.main.len()) < self.delayed.len()
    }

    /// The payload at `idx` in the logical `main ++ delayed` sequence.
    pub fn at(&self, idx: usize) -> &Payload {
        if idx < self.main.len() {
            &self.main[idx]
        } else {
            &self.delayed[idx - self.main.len()]
        }
    }

    /// The deadline of the payload at `idx` in `main ++ delayed`. Entries
    /// in the `delayed` segment report 0: their deadline already fired and
    /// no further policy action applies.
    pub fn timeout_at(&self, idx: usize) -> u64 {
        if idx < self.main.len() {
            self.deadline_ns[idx]
        } else {
            0
        }
    }

    /// Swap out and return the rejected payloads awaiting failure
    /// completion.
    pub fn release_rejected(&mut self) -> VecDeque<Payload> {
        std::mem::take(&mut self.rejected)
    }
}

/// Incremental scan state for pending-batch assembly.
#[derive(Debug, Clone, Default)]
struct PendingCursor {
    /// Level currently being scanned.
    curr_level: u32,
    /// Next candidate position within the level's `main ++ delayed`.
    queue_idx: usize,
    /// Minimum non-zero deadline among admitted payloads; 0 if none carry
    /// one.
    closest_deadline_ns: u64,
    /// Minimum queue-entry timestamp among admitted payloads.
    oldest_enqueue_ns: u64,
    /// Payloads admitted to the candidate batch so far.
    pending_count: usize,
    valid: bool,
}

/// Priority-ordered collection of [`PolicyQueue`]s with a pending cursor.
#[derive(Debug)]
pub struct PriorityQueue {
    queues: BTreeMap<u32, PolicyQueue>,
    default_policy: QueuePolicy,
    /// Total admitted (non-rejected) payloads across all levels.
    size: usize,
    cursor: PendingCursor,
}

impl PriorityQueue {
    /// Build the level map. `priority_levels == 0` gives a single flat
    /// level 0; otherwise levels `1..=priority_levels` exist, each using
    /// `default_policy` unless overridden.
    pub fn new(default_policy: QueuePolicy, priority_levels: u32, overrides: &QueuePolicyMap) -> Self {
        let mut queues = BTreeMap::new();
        if priority_levels == 0 {
            queues.insert(0, PolicyQueue::new(default_policy.clone()));
        } else {
            for level in 1..=priority_levels {
                let policy = overrides
                    .get(&level)
                    .cloned()
                    .unwrap_or_else(|| default_policy.clone());
                queues.insert(level, PolicyQueue::new(policy));
            }
        }
        let mut queue = Self { queues, default_policy, size: 0, cursor: PendingCursor::default() };
        queue.reset_cursor();
        queue
    }

    /// Total admitted payload count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether no admitted payload remains at any level.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Admitted payload count per level, for monitoring.
    pub fn queue_depths(&self) -> BTreeMap<u32, usize> {
        self.queues.iter().map(|(level, q)| (*level, q.size())).collect()
    }

    /// Admit a payload at `level`, creating the level with the default
    /// policy if it does not exist yet.
    ///
    /// A valid cursor is invalidated when the payload lands at or before
    /// the level it is scanning: such an arrival may belong to the batch
    /// ahead of items already admitted. An arrival strictly after the scan
    /// level cannot displace anything and leaves the cursor alone.
    pub fn enqueue(&mut self, level: u32, payload: Payload) -> Result<(), EnqueueReject> {
        let default_policy = self.default_policy.clone();
        let queue = self
            .queues
            .entry(level)
            .or_insert_with(|| PolicyQueue::new(default_policy));
        queue.enqueue(payload)?;
        self.size += 1;
        if self.cursor.valid && level <= self.cursor.curr_level {
            self.cursor.valid = false;
        }
        Ok(())
    }

    /// Remove and return the frontmost payload of the highest-priority
    /// non-empty level. Invalidates the cursor.
    ///
    /// Calling this on an empty queue is a precondition violation and
    /// reports [`SchedulerError::Internal`].
    pub fn dequeue(&mut self) -> Result<Payload, SchedulerError> {
        self.cursor.valid = false;
        for queue in self.queues.values_mut() {
            if let Some(payload) = queue.dequeue() {
                self.size -= 1;
                return Ok(payload);
            }
        }
        Err(SchedulerError::internal("dequeue on empty priority queue"))
    }

    /// Collect the rejected payloads of every level, in priority order.
    pub fn release_rejected_payloads(&mut self) -> Vec<VecDeque<Payload>> {
        self.queues
            .values_mut()
            .map(|queue| queue.release_rejected())
            .collect()
    }

    /// Whether the pending batch recorded by the cursor is still usable:
    /// the cursor was not invalidated by a queue mutation and no admitted
    /// payload's deadline has elapsed.
    pub fn is_cursor_valid(&self) -> bool {
        self.cursor.valid && now_monotonic_ns() < self.cursor.closest_deadline_ns
    }

    /// Whether in-progress batch assembly must restart: a queue mutation
    /// invalidated the cursor, or an admitted deadline elapsed. Unlike
    /// [`is_cursor_valid`](Self::is_cursor_valid), a batch with no admitted
    /// deadline is not considered stale here.
    pub fn cursor_interrupted(&self) -> bool {
        !self.cursor.valid
            || (self.cursor.closest_deadline_ns != 0
                && now_monotonic_ns() >= self.cursor.closest_deadline_ns)
    }

    /// Payloads admitted to the candidate batch so far.
    pub fn pending_count(&self) -> usize {
        self.cursor.pending_count
    }

    /// Minimum non-zero deadline among admitted payloads; 0 if none.
    pub fn closest_deadline_ns(&self) -> u64 {
        self.cursor.closest_deadline_ns
    }

    /// Minimum queue-entry timestamp among admitted payloads; 0 before the
    /// first admission.
    pub fn oldest_enqueue_ns(&self) -> u64 {
        self.cursor.oldest_enqueue_ns
    }

    /// The payload the cursor is parked on, or `None` when every admitted
    /// payload is already in the pending batch.
    ///
    /// Only meaningful right after
    /// [`apply_policy_at_cursor`](Self::apply_policy_at_cursor).
    pub fn candidate(&self) -> Option<&Payload> {
        if self.cursor.pending_count >= self.size {
            return None;
        }
        let queue = self.queues.get(&self.cursor.curr_level)?;
        if self.cursor.queue_idx < queue.size() {
            Some(queue.at(self.cursor.queue_idx))
        } else {
            None
        }
    }

    /// Drive the cursor forward across expired entries, migrating or
    /// rejecting them per level policy, until it parks on an unexpired
    /// candidate or every remaining payload is already pending.
    ///
    /// Returns the accumulated batch size of payloads rejected on this
    /// pass, for the caller to surface.
    pub fn apply_policy_at_cursor(&mut self) -> u64 {
        let mut rejected_count = 0usize;
        let mut rejected_batch_size = 0u64;
        loop {
            let idx = self.cursor.queue_idx;
            let has_candidate = match self.queues.get_mut(&self.cursor.curr_level) {
                Some(queue) => {
                    queue.apply_policy(idx, &mut rejected_count, &mut rejected_batch_size)
                }
                None => false,
            };
            if !has_candidate && self.size > self.cursor.pending_count + rejected_count {
                // Unadmitted payloads remain, so a later level must hold
                // them. The cursor never runs past the last level: when it
                // could, every remaining payload is already pending and we
                // break above instead.
                match self.next_level(self.cursor.curr_level) {
                    Some(next) => {
                        self.cursor.curr_level = next;
                        self.cursor.queue_idx = 0;
                        continue;
                    }
                    None => {
                        debug_assert!(false, "pending cursor ran past the last priority level");
                        break;
                    }
                }
            }
            break;
        }
        self.size -= rejected_count;
        rejected_batch_size
    }

    /// Admit the payload the cursor is parked on into the pending batch,
    /// folding its deadline and queue-entry time into the batch-wide
    /// minima. No-op when everything is already pending.
    pub fn advance_cursor(&mut self) {
        if self.cursor.pending_count >= self.size {
            return;
        }
        let queue = match self.queues.get(&self.cursor.curr_level) {
            Some(queue) => queue,
            None => return,
        };

        let deadline_ns = queue.timeout_at(self.cursor.queue_idx);
        if deadline_ns != 0 {
            self.cursor.closest_deadline_ns = match self.cursor.closest_deadline_ns {
                0 => deadline_ns,
                closest => closest.min(deadline_ns),
            };
        }

        let enqueue_ns = queue
            .at(self.cursor.queue_idx)
            .timers()
            .timestamp(TimestampKind::QueueStart);
        self.cursor.oldest_enqueue_ns = match self.cursor.oldest_enqueue_ns {
            0 => enqueue_ns,
            oldest => oldest.min(enqueue_ns),
        };

        self.cursor.queue_idx += 1;
        self.cursor.pending_count += 1;
    }

    /// Park the cursor at the front of the highest-priority level with an
    /// empty pending batch.
    pub fn reset_cursor(&mut self) {
        let first_level = self.queues.keys().next().copied().unwrap_or(0);
        self.cursor = PendingCursor {
            curr_level: first_level,
            queue_idx: 0,
            closest_deadline_ns: 0,
            oldest_enqueue_ns: 0,
            pending_count: 0,
            valid: true,
        };
    }

    fn next_level(&self, level: u32) -> Option<u32> {
        self.queues
            .range((Excluded(level), Unbounded))
            .next()
            .map(|(next, _)| *next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::test_util::{probe_sink, TestRequest};

    fn payload(batch_size: u64) -> Payload {
        let (sink, _rx) = probe_sink();
        Payload::new(Arc::new(TestRequest::new(batch_size)), sink)
    }

    fn payload_with_timeout(batch_size: u64, timeout_us: u64) -> Payload {
        let (sink, _rx) = probe_sink();
        Payload::new(
            Arc::new(TestRequest::new(batch_size).with_timeout_us(timeout_us)),
            sink,
        )
    }

    fn reject_policy(timeout_us: u64) -> QueuePolicy {
        QueuePolicy {
            default_timeout_us: timeout_us,
            timeout_action: TimeoutAction::Reject,
            ..QueuePolicy::default()
        }
    }

    fn delay_policy(timeout_us: u64) -> QueuePolicy {
        QueuePolicy {
            default_timeout_us: timeout_us,
            timeout_action: TimeoutAction::Delay,
            ..QueuePolicy::default()
        }
    }

    #[test]
    fn test_policy_queue_capacity() {
        let mut queue = PolicyQueue::new(QueuePolicy {
            max_queue_size: 2,
            ..reject_policy(5_000)
        });

        queue.enqueue(payload(1)).unwrap();
        queue.enqueue(payload(1)).unwrap();

        let reject = queue.enqueue(payload(1)).unwrap_err();
        assert_eq!(reject.error, SchedulerError::QueueFull);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_policy_queue_unbounded_when_zero() {
        let mut queue = PolicyQueue::new(QueuePolicy::default());
        for _ in 0..100 {
            queue.enqueue(payload(1)).unwrap();
        }
        assert_eq!(queue.size(), 100);
    }

    #[test]
    fn test_effective_deadline_narrows_but_cannot_widen() {
        let mut queue = PolicyQueue::new(QueuePolicy {
            default_timeout_us: 10_000,
            allow_timeout_override: true,
            ..QueuePolicy::default()
        });

        let before = now_monotonic_ns();
        // 20ms request cannot widen the 10ms default.
        queue.enqueue(payload_with_timeout(1, 20_000)).unwrap();
        // 3ms request narrows it.
        queue.enqueue(payload_with_timeout(1, 3_000)).unwrap();
        let after = now_monotonic_ns();

        let first = queue.timeout_at(0);
        let second = queue.timeout_at(1);
        assert!(first >= before + 10_000 * 1000);
        assert!(first <= after + 10_000 * 1000);
        assert!(second >= before + 3_000 * 1000);
        assert!(second <= after + 3_000 * 1000);
    }

    #[test]
    fn test_no_deadline_when_timeout_zero() {
        let mut queue = PolicyQueue::new(QueuePolicy::default());
        queue.enqueue(payload(1)).unwrap();
        assert_eq!(queue.timeout_at(0), 0);
    }

    #[test]
    fn test_apply_policy_delays_expired() {
        let mut queue = PolicyQueue::new(delay_policy(1_000));
        queue.enqueue(payload(1)).unwrap();
        queue.enqueue(payload(2)).unwrap();
        sleep(Duration::from_millis(3));

        let mut rejected_count = 0;
        let mut rejected_batch_size = 0;
        // Both expired into `delayed`; idx 0 now points at the delayed
        // segment, which is still a candidate.
        assert!(queue.apply_policy(0, &mut rejected_count, &mut rejected_batch_size));
        assert_eq!(rejected_count, 0);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.timeout_at(0), 0);

        // Delayed payloads drain in the order they expired.
        assert_eq!(queue.dequeue().unwrap().batch_size(), 1);
        assert_eq!(queue.dequeue().unwrap().batch_size(), 2);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_apply_policy_rejects_expired() {
        let mut queue = PolicyQueue::new(reject_policy(1_000));
        queue.enqueue(payload(2)).unwrap();
        queue.enqueue(payload(3)).unwrap();
        sleep(Duration::from_millis(3));

        let mut rejected_count = 0;
        let mut rejected_batch_size = 0;
        // Everything expired and nothing is delayed: no candidate remains.
        assert!(!queue.apply_policy(0, &mut rejected_count, &mut rejected_batch_size));
        assert_eq!(rejected_count, 2);
        assert_eq!(rejected_batch_size, 5);
        assert!(queue.is_empty());

        let rejected = queue.release_rejected();
        assert_eq!(rejected.len(), 2);
        assert!(queue.release_rejected().is_empty());
    }

    #[test]
    fn test_apply_policy_stops_at_unexpired() {
        let mut queue = PolicyQueue::new(QueuePolicy {
            default_timeout_us: 10_000_000,
            allow_timeout_override: true,
            timeout_action: TimeoutAction::Reject,
            ..QueuePolicy::default()
        });
        // First expires quickly, second keeps the 10s default.
        queue.enqueue(payload_with_timeout(1, 500)).unwrap();
        queue.enqueue(payload(2)).unwrap();
        sleep(Duration::from_millis(2));

        let mut rejected_count = 0;
        let mut rejected_batch_size = 0;
        let parked = queue.apply_policy(0, &mut rejected_count, &mut rejected_batch_size);

        // The walk rejects the expired head and stops at the first entry
        // still inside its deadline.
        assert!(parked);
        assert_eq!(rejected_count, 1);
        assert_eq!(rejected_batch_size, 1);
        assert_eq!(queue.at(0).batch_size(), 2);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_priority_order_across_levels() {
        let mut queue = PriorityQueue::new(reject_policy(10_000), 2, &QueuePolicyMap::new());

        queue.enqueue(2, payload(1)).unwrap();
        queue.enqueue(1, payload(2)).unwrap();
        assert_eq!(queue.size(), 2);

        // Level 1 drains before level 2 even though it arrived later.
        assert_eq!(queue.dequeue().unwrap().batch_size(), 2);
        assert_eq!(queue.dequeue().unwrap().batch_size(), 1);
        assert!(queue.dequeue().is_err());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 0, &QueuePolicyMap::new());

        for id in 1..=4 {
            queue.enqueue(0, payload(id)).unwrap();
        }
        for id in 1..=4 {
            assert_eq!(queue.dequeue().unwrap().batch_size(), id);
        }
    }

    #[test]
    fn test_level_created_lazily_with_default_policy() {
        let mut queue = PriorityQueue::new(
            QueuePolicy { max_queue_size: 1, ..QueuePolicy::default() },
            2,
            &QueuePolicyMap::new(),
        );

        // Level 7 was never configured; it inherits the default policy.
        queue.enqueue(7, payload(1)).unwrap();
        let reject = queue.enqueue(7, payload(1)).unwrap_err();
        assert_eq!(reject.error, SchedulerError::QueueFull);
    }

    #[test]
    fn test_policy_override_per_level() {
        let mut overrides = QueuePolicyMap::new();
        overrides.insert(1, QueuePolicy { max_queue_size: 1, ..QueuePolicy::default() });
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 2, &overrides);

        queue.enqueue(1, payload(1)).unwrap();
        assert!(queue.enqueue(1, payload(1)).is_err());
        // Level 2 keeps the unbounded default.
        queue.enqueue(2, payload(1)).unwrap();
        queue.enqueue(2, payload(1)).unwrap();
    }

    fn admit_first(queue: &mut PriorityQueue) {
        queue.reset_cursor();
        queue.apply_policy_at_cursor();
        queue.advance_cursor();
    }

    #[test]
    fn test_cursor_invalidated_by_enqueue_at_or_before_scan_level() {
        let mut queue = PriorityQueue::new(reject_policy(10_000_000), 2, &QueuePolicyMap::new());
        queue.enqueue(2, payload(1)).unwrap();
        admit_first(&mut queue);
        assert!(queue.is_cursor_valid());

        // Arrival at a higher-priority level invalidates the scan.
        queue.enqueue(1, payload(1)).unwrap();
        assert!(!queue.is_cursor_valid());
        assert!(queue.cursor_interrupted());
    }

    #[test]
    fn test_cursor_invalidated_by_same_level_enqueue() {
        let mut queue = PriorityQueue::new(reject_policy(10_000_000), 2, &QueuePolicyMap::new());
        queue.enqueue(2, payload(1)).unwrap();
        admit_first(&mut queue);

        queue.enqueue(2, payload(1)).unwrap();
        assert!(!queue.is_cursor_valid());
    }

    #[test]
    fn test_cursor_survives_enqueue_after_scan_level() {
        let mut queue = PriorityQueue::new(reject_policy(10_000_000), 3, &QueuePolicyMap::new());
        queue.enqueue(2, payload(1)).unwrap();
        admit_first(&mut queue);
        assert!(queue.is_cursor_valid());

        // An arrival strictly after the scan level cannot displace the
        // admitted payload.
        queue.enqueue(3, payload(1)).unwrap();
        assert!(queue.is_cursor_valid());
    }

    #[test]
    fn test_cursor_invalidated_by_dequeue() {
        let mut queue = PriorityQueue::new(reject_policy(10_000_000), 1, &QueuePolicyMap::new());
        queue.enqueue(1, payload(1)).unwrap();
        queue.enqueue(1, payload(1)).unwrap();
        admit_first(&mut queue);
        assert!(queue.is_cursor_valid());

        queue.dequeue().unwrap();
        assert!(!queue.is_cursor_valid());
    }

    #[test]
    fn test_cursor_goes_stale_when_admitted_deadline_elapses() {
        let mut queue = PriorityQueue::new(reject_policy(1_000), 1, &QueuePolicyMap::new());
        queue.enqueue(1, payload(1)).unwrap();
        admit_first(&mut queue);
        assert!(queue.is_cursor_valid());

        sleep(Duration::from_millis(3));
        assert!(!queue.is_cursor_valid());
        assert!(queue.cursor_interrupted());
    }

    #[test]
    fn test_cursor_with_no_deadlines_reports_invalid_between_cycles() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 1, &QueuePolicyMap::new());
        queue.enqueue(1, payload(1)).unwrap();
        admit_first(&mut queue);

        // No admitted deadline: the batch is rebuilt next cycle, but
        // in-progress assembly is not considered interrupted.
        assert!(!queue.is_cursor_valid());
        assert!(!queue.cursor_interrupted());
    }

    #[test]
    fn test_closest_deadline_is_min_nonzero() {
        let policy = QueuePolicy {
            default_timeout_us: 50_000,
            allow_timeout_override: true,
            ..QueuePolicy::default()
        };
        let mut queue = PriorityQueue::new(policy, 1, &QueuePolicyMap::new());
        queue.enqueue(1, payload_with_timeout(1, 40_000)).unwrap();
        queue.enqueue(1, payload_with_timeout(1, 20_000)).unwrap();
        queue.enqueue(1, payload_with_timeout(1, 30_000)).unwrap();

        queue.reset_cursor();
        queue.apply_policy_at_cursor();
        queue.advance_cursor();
        let after_first = queue.closest_deadline_ns();
        assert_ne!(after_first, 0);

        queue.apply_policy_at_cursor();
        queue.advance_cursor();
        let after_second = queue.closest_deadline_ns();
        assert!(after_second < after_first);

        queue.apply_policy_at_cursor();
        queue.advance_cursor();
        // The 30ms deadline does not displace the 20ms minimum.
        assert_eq!(queue.closest_deadline_ns(), after_second);
        assert_eq!(queue.pending_count(), 3);
    }

    #[test]
    fn test_oldest_enqueue_tracks_first_arrival() {
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 2, &QueuePolicyMap::new());
        queue.enqueue(2, payload(1)).unwrap();
        sleep(Duration::from_millis(1));
        queue.enqueue(1, payload(2)).unwrap();

        queue.reset_cursor();
        queue.apply_policy_at_cursor();
        queue.advance_cursor();
        // Cursor admits level 1 (the newer payload) first.
        let newer = queue.oldest_enqueue_ns();
        queue.apply_policy_at_cursor();
        queue.advance_cursor();
        let oldest = queue.oldest_enqueue_ns();

        assert!(oldest < newer);
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_cursor_steps_levels_over_rejected_entries() {
        let mut overrides = QueuePolicyMap::new();
        overrides.insert(1, reject_policy(500));
        let mut queue = PriorityQueue::new(QueuePolicy::default(), 2, &overrides);

        queue.enqueue(1, payload(2)).unwrap();
        queue.enqueue(2, payload(3)).unwrap();
        sleep(Duration::from_millis(2));

        queue.reset_cursor();
        let rejected_batch_size = queue.apply_policy_at_cursor();
        assert_eq!(rejected_batch_size, 2);
        assert_eq!(queue.size(), 1);

        // Cursor stepped past the emptied level 1 and parked on level 2.
        let candidate = queue.candidate().expect("candidate at level 2");
        assert_eq!(candidate.batch_size(), 3);

        queue.advance_cursor();
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.candidate().is_none());
    }

    #[test]
    fn test_release_rejected_payloads_in_priority_order() {
        let mut queue = PriorityQueue::new(reject_policy(500), 2, &QueuePolicyMap::new());
        queue.enqueue(2, payload(9)).unwrap();
        queue.enqueue(1, payload(8)).unwrap();
        sleep(Duration::from_millis(2));

        queue.reset_cursor();
        queue.apply_policy_at_cursor();

        let rejected = queue.release_rejected_payloads();
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].front().unwrap().batch_size(), 8);
        assert_eq!(rejected[1].front().unwrap().batch_size(), 9);
        assert!(queue.is_empty());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            // size == enqueued - dequeued - rejected, across arbitrary
            // interleavings of operations and timeout policies.
            #[test]
            fn prop_count_conservation(ops in prop::collection::vec((0u8..3, 0u32..3), 1..64)) {
                let mut overrides = QueuePolicyMap::new();
                overrides.insert(2, reject_policy(50));
                overrides.insert(3, delay_policy(50));
                let mut queue = PriorityQueue::new(QueuePolicy::default(), 3, &overrides);

                let mut enqueued = 0usize;
                let mut dequeued = 0usize;
                let mut rejected = 0usize;
                for (op, level) in ops {
                    match op {
                        0 => {
                            queue.enqueue(level + 1, payload(1)).unwrap();
                            enqueued += 1;
                        }
                        1 => {
                            if !queue.is_empty() {
                                queue.dequeue().unwrap();
                                dequeued += 1;
                            }
                        }
                        _ => {
                            queue.reset_cursor();
                            queue.apply_policy_at_cursor();
                        }
                    }
                    rejected += queue
                        .release_rejected_payloads()
                        .iter()
                        .map(|q| q.len())
                        .sum::<usize>();
                    prop_assert_eq!(queue.size(), enqueued - dequeued - rejected);
                }
            }

            // Payloads without deadlines drain in enqueue order.
            #[test]
            fn prop_fifo_within_main(ops in prop::collection::vec(prop::bool::ANY, 1..64)) {
                let mut queue = PriorityQueue::new(QueuePolicy::default(), 0, &QueuePolicyMap::new());
                let mut model = std::collections::VecDeque::new();
                let mut next_id = 1u64;

                for enqueue in ops {
                    if enqueue {
                        queue.enqueue(0, payload(next_id)).unwrap();
                        model.push_back(next_id);
                        next_id += 1;
                    } else if !queue.is_empty() {
                        let got = queue.dequeue().unwrap().batch_size();
                        prop_assert_eq!(Some(got), model.pop_front());
                    }
                }
                while !queue.is_empty() {
                    let got = queue.dequeue().unwrap().batch_size();
                    prop_assert_eq!(Some(got), model.pop_front());
                }
            }

            // The highest-priority non-empty level always drains first.
            #[test]
            fn prop_priority_preemption(levels in prop::collection::vec(1u32..4, 1..32)) {
                let mut queue = PriorityQueue::new(QueuePolicy::default(), 3, &QueuePolicyMap::new());
                for level in &levels {
                    queue.enqueue(*level, payload(u64::from(*level))).unwrap();
                }

                let mut remaining = levels.clone();
                while !queue.is_empty() {
                    let got = queue.dequeue().unwrap().batch_size() as u32;
                    let min = *remaining.iter().min().unwrap();
                    prop_assert_eq!(got, min);
                    let pos = remaining.iter().position(|l| *l == min).unwrap();
                    remaining.remove(pos);
                }
            }
        }
    }
}
