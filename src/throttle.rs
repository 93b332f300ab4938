//! Per-connection token bucket modeling the IoT-Core publish rate limit.
//!
//! The publisher loop asks a connection how long it would need to wait for
//! a token to be available, sleeps that long, and then proceeds — it never
//! blocks inside the throttle itself, so a single `sleep` covers the wait
//! with no double-waiting (spec §4.2).

use std::time::Duration;

use tokio::time::Instant;

/// A token bucket refilling at a fixed rate, capped at `capacity` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns the wait that would make the next `acquire()` non-blocking,
    /// without actually consuming a token or sleeping.
    pub fn wait_for_next_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }

    /// Consumes a token. Callers are expected to have already waited for
    /// `wait_for_next_token()` to reach zero; if they have not, the bucket
    /// still allows the draw and goes into deficit rather than panicking —
    /// the next `wait_for_next_token()` simply reports a longer wait.
    pub fn acquire(&mut self) {
        self.refill();
        self.tokens -= 1.0;
    }
}
