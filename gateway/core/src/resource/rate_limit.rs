//! Token bucket rate limiting per target
//!
//! - Tokens are added continuously at `rate` per `per`
//! - Tokens accumulate up to `burst`; the bucket starts full
//! - Each call consumes one token
//! - When the bucket is empty the caller sleeps until the next token

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Longest single sleep while waiting for a token
const MAX_WAIT_STEP: Duration = Duration::from_secs(1);

/// Rate limit for one target
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens added per `per`
    pub rate: u32,

    /// Refill period
    pub per: Duration,

    /// Bucket capacity
    pub burst: u32,
}

impl RateLimit {
    /// `rate` calls per second with a burst equal to the rate
    #[must_use]
    pub fn per_second(rate: u32) -> Self {
        Self {
            rate,
            per: Duration::from_secs(1),
            burst: rate.max(1),
        }
    }

    /// Set the bucket capacity
    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst.max(1);
        self
    }

    fn tokens_per_sec(&self) -> f64 {
        let per = self.per.as_secs_f64();
        if per <= 0.0 {
            f64::INFINITY
        } else {
            f64::from(self.rate) / per
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Async token bucket
#[derive(Debug)]
pub struct TokenBucket {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: f64::from(limit.burst.max(1)),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take a token if one is available, otherwise report the wait until the next
    ///
    /// # Errors
    ///
    /// Returns the time until a token becomes available when the bucket is empty.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let rate = self.limit.tokens_per_sec();
        if rate <= 0.0 {
            return Err(MAX_WAIT_STEP);
        }
        let missing = 1.0 - state.tokens;
        let wait = Duration::try_from_secs_f64(missing / rate).unwrap_or(MAX_WAIT_STEP);
        Err(wait.max(Duration::from_millis(1)))
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting for token");
                    tokio::time::sleep(wait.min(MAX_WAIT_STEP)).await;
                }
            }
        }
    }

    /// Whole tokens currently available
    #[must_use]
    pub fn available_tokens(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        // Bounded by burst, which is a u32
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = state.tokens.floor() as u32;
        whole
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let capacity = f64::from(self.limit.burst.max(1));
        state.tokens = (state.tokens + elapsed * self.limit.tokens_per_sec()).min(capacity);
        state.last_refill = now;
    }
}
