//! Retry pacing shared by the receive, extension, and delete paths.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff with an upper bound: the one retry policy for every
/// queue-service call the runtime repeats.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
        }
    }

    /// Delay before the next attempt; doubles on each call up to the cap.
    pub fn delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    /// Like [`Backoff::delay`], with full jitter so independent loops
    /// hitting the same error spread their retries out.
    pub fn jittered_delay(&mut self) -> Duration {
        self.delay().mul_f64(rand::rng().random_range(0.0..=1.0))
    }

    /// Forget accumulated failures after a success.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}
