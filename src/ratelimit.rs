//! Global admission control for outbound requests.
//!
//! A single token bucket is shared by every session in the process; each
//! API call acquires one token before going out on the wire. Tokens are
//! fractional so the rate is continuous rather than stepped.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

pub const DEFAULT_RATE: f64 = 2.0;
pub const DEFAULT_CAPACITY: f64 = 5.0;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

/// Token bucket with a fixed capacity and an adjustable refill rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Acquire `tokens` from the bucket.
    ///
    /// Non-blocking acquisition returns `false` when the bucket cannot
    /// cover the request. Blocking acquisition sleeps for the estimated
    /// refill time (the lock is released across the sleep) and retries.
    pub async fn acquire(&self, tokens: f64, blocking: bool) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("token bucket lock poisoned");
                self.refill(&mut state);
                if state.tokens >= tokens {
                    state.tokens -= tokens;
                    return true;
                }
                if !blocking {
                    return false;
                }
                (tokens - state.tokens) / state.rate
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Replace the refill rate. The interval since the last refill is
    /// credited at the old rate first.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        self.refill(&mut state);
        state.rate = rate;
    }

    /// Current token count after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("token bucket lock poisoned");
        self.refill(&mut state);
        state.tokens
    }
}

static GLOBAL: OnceLock<Arc<TokenBucket>> = OnceLock::new();

/// Initialize the process-wide bucket. Idempotent: the first caller wins
/// and later calls return the existing instance.
pub fn init(rate: f64, capacity: f64) -> Arc<TokenBucket> {
    GLOBAL
        .get_or_init(|| Arc::new(TokenBucket::new(rate, capacity)))
        .clone()
}

/// The process-wide bucket, lazily created with the default parameters if
/// nothing initialized it explicitly.
pub fn shared() -> Arc<TokenBucket> {
    init(DEFAULT_RATE, DEFAULT_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_bucket_admits_capacity_then_rejects() {
        let bucket = TokenBucket::new(0.001, 3.0);
        for _ in 0..3 {
            assert!(bucket.acquire(1.0, false).await);
        }
        assert!(!bucket.acquire(1.0, false).await);
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(100.0, 1.0);
        assert!(bucket.acquire(1.0, false).await);

        let start = Instant::now();
        assert!(bucket.acquire(1.0, true).await);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn raising_the_rate_speeds_up_refill() {
        let bucket = TokenBucket::new(1.0, 100.0);
        assert!(bucket.acquire(100.0, false).await);

        bucket.set_rate(50.0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let available = bucket.available();
        // 300ms at 50 tokens/s is ~15; the old rate would have produced ~0.3.
        assert!(available >= 5.0, "available = {available}");
    }

    #[tokio::test]
    async fn tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(10_000.0, 5.0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.available() <= 5.0);
    }

    #[tokio::test]
    async fn fractional_tokens_are_supported() {
        let bucket = TokenBucket::new(0.001, 1.0);
        assert!(bucket.acquire(0.25, false).await);
        assert!(bucket.acquire(0.75, false).await);
        assert!(!bucket.acquire(0.5, false).await);
    }
}
