//! Token bucket bandwidth limiter shared by all workers of one pipeline direction.
//!
//! Throttling is advisory: a caller is told how long to sleep, never refused.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes per second; zero disables throttling.
    rate: u64,
    /// Burst capacity in bytes.
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Self {
        Self::with_burst(rate, rate)
    }

    pub fn with_burst(rate: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Takes `amount` tokens and returns how long the caller should wait for
    /// the bucket to be back in balance.
    pub fn consume(&self, amount: u64) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.capacity);
        state.last_refill = now;
        state.tokens -= amount as f64;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate as f64)
        }
    }

    pub async fn throttle(&self, amount: u64) {
        let wait = self.consume(amount);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
