//! Per-request lifecycle timestamps.
//!
//! Every payload carries a [`RequestTimers`] recording when it hit the
//! stages of request handling. All timestamps come from one process-wide
//! monotonic clock; deadlines are never computed from wall time.

use std::time::Instant;

use once_cell::sync::Lazy;

static CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time in nanoseconds since the process clock base.
///
/// Never returns 0; a zero timestamp always means "unset".
pub fn now_monotonic_ns() -> u64 {
    (CLOCK_BASE.elapsed().as_nanos() as u64).max(1)
}

/// Stages of request handling that get timestamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// The start of request handling.
    RequestStart,
    /// The end of request handling.
    RequestEnd,
    /// The first byte of the request sent to the backend.
    SendStart,
    /// The last byte of the request sent to the backend.
    SendEnd,
    /// The first byte of the response received from the backend.
    RecvStart,
    /// The last byte of the response received from the backend.
    RecvEnd,
    /// The request entered its scheduling queue.
    QueueStart,
}

const KIND_COUNT: usize = 7;

/// Named monotonic timestamps for one request.
///
/// A timer belongs to exactly one payload and is owned by one thread at a
/// time, so there is no internal synchronization.
#[derive(Debug, Clone, Default)]
pub struct RequestTimers {
    timestamps: [u64; KIND_COUNT],
}

impl RequestTimers {
    /// Create a timer with all timestamps unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the timestamp for a kind, in nanoseconds. 0 means unset.
    pub fn timestamp(&self, kind: TimestampKind) -> u64 {
        self.timestamps[kind as usize]
    }

    /// Set a timestamp to the current monotonic time and return it.
    pub fn capture(&mut self, kind: TimestampKind) -> u64 {
        let ts = now_monotonic_ns();
        self.timestamps[kind as usize] = ts;
        ts
    }

    /// Duration between two timestamps in nanoseconds.
    ///
    /// Returns `u64::MAX` when either endpoint is unset or the start lies
    /// after the end, so a bogus interval can never look like a short one.
    pub fn duration(&self, start: TimestampKind, end: TimestampKind) -> u64 {
        let stime = self.timestamps[start as usize];
        let etime = self.timestamps[end as usize];
        if stime == 0 || etime == 0 || stime > etime {
            return u64::MAX;
        }
        etime - stime
    }

    /// Reset all timestamps to unset. Must be called before re-using the
    /// timer for another request.
    pub fn reset(&mut self) {
        self.timestamps = [0; KIND_COUNT];
    }
}
