//! Exponential retry delay shared by the upstream watch sessions and the
//! client reconnector (independent instances, same doubling law).

use std::time::Duration;

/// Doubling backoff: `min(base * 2^n, cap)` across consecutive failures,
/// reset to the base on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, next: base }
    }

    /// Delay to wait before the next attempt; doubles for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay + delay).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}
