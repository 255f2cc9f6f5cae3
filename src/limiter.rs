//! Token-bucket admission gate.
//!
//! Admission tokens are abstract dispatch credits, unrelated to the LLM text
//! tokens counted by the usage tracker. The bucket refills lazily at the
//! moment of access; there is no background timer.

use crate::clock::SharedClock;
use crate::config::LimiterConfig;

/// A lazily refilled token bucket.
///
/// Checked on every dispatch attempt, independent of and in addition to
/// priority ordering — a high-tier request still waits when the bucket is
/// empty.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    available: f64,
    last_refill_ms: u64,
    clock: SharedClock,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: LimiterConfig, clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            available: config.capacity,
            last_refill_ms: now,
            clock,
        }
    }

    fn refill(&mut self) {
        let now = self.clock.now_millis();
        let elapsed_secs = now.saturating_sub(self.last_refill_ms) as f64 / 1_000.0;
        self.available = (self.available + self.refill_rate * elapsed_secs).min(self.capacity);
        self.last_refill_ms = now;
    }

    /// Tokens available right now, computed lazily.
    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.available
    }

    /// Consume one token if at least one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token becomes available. Zero when one already is.
    pub fn wait_time_secs(&mut self) -> f64 {
        self.refill();
        if self.available >= 1.0 {
            0.0
        } else {
            (1.0 - self.available) / self.refill_rate
        }
    }
}
