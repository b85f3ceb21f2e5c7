use std::time::{Duration, Instant};

/// Tracks mutation counts and decides when the worker should issue a
/// durability barrier.
///
/// With the adaptive policy the threshold climbs as the store warms up:
/// young stores flush eagerly, busy stores amortise the barrier over more
/// operations. A time-based cadence backstops quiet periods so pending
/// mutations never sit unflushed indefinitely.
pub struct FlushTracker {
    ops_since_flush: u64,
    ops_lifetime: u64,
    last_flush: Instant,
    adaptive: bool,
    auto_flush: Duration,
}

const FIXED_THRESHOLD: u64 = 10;

impl FlushTracker {
    pub fn new(adaptive: bool, auto_flush: Duration) -> Self {
        Self {
            ops_since_flush: 0,
            ops_lifetime: 0,
            last_flush: Instant::now(),
            adaptive,
            auto_flush,
        }
    }

    /// Record `count` applied mutations
    pub fn record(&mut self, count: u64) {
        self.ops_since_flush += count;
        self.ops_lifetime += count;
    }

    /// Current flush threshold, scaled by lifetime operation count
    pub fn threshold(&self) -> u64 {
        if !self.adaptive {
            return FIXED_THRESHOLD;
        }
        match self.ops_lifetime {
            0..100 => 10,
            100..1000 => 15,
            _ => 20,
        }
    }

    /// Should the worker flush after the operation it just applied?
    pub fn should_flush(&self) -> bool {
        self.ops_since_flush >= self.threshold()
            || (self.ops_since_flush > 0 && self.last_flush.elapsed() >= self.auto_flush)
    }

    /// Are there mutations the backing has not seen?
    pub fn pending(&self) -> bool {
        self.ops_since_flush > 0
    }

    /// Has the time-based cadence elapsed with mutations pending?
    pub fn timer_due(&self) -> bool {
        self.ops_since_flush > 0 && self.last_flush.elapsed() >= self.auto_flush
    }

    /// Reset after a completed flush
    pub fn reset(&mut self) {
        self.ops_since_flush = 0;
        self.last_flush = Instant::now();
    }

    pub fn ops_lifetime(&self) -> u64 {
        self.ops_lifetime
    }

    pub fn ops_since_flush(&self) -> u64 {
        self.ops_since_flush
    }
}
