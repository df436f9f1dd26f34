//! Byte-denominated token bucket used to pace frame writes.

use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Floor capacity so a low configured rate still allows reasonably sized
/// bursts instead of trickling single bytes.
const MIN_CAPACITY: u64 = 64 * 1024;

struct Bucket {
    capacity: u64,
    tokens: f64,
    rate_per_sec: u64,
    last_refill: Instant,
}

/// Leaky-bucket-style pacer measured in bytes per second.
pub struct TokenBucket {
    inner: Mutex<Bucket>,
}

impl TokenBucket {
    /// `rate_per_sec` of 0 disables pacing entirely (unlimited).
    /// `burst_ratio` controls how many seconds worth of `rate` may be
    /// spent in a single burst; capacity is `rate / burst_ratio`, floored
    /// at [`MIN_CAPACITY`].
    pub fn new(rate_per_sec: u64, burst_ratio: f64) -> Self {
        let capacity = if rate_per_sec == 0 {
            u64::MAX
        } else {
            ((rate_per_sec as f64 / burst_ratio.max(0.001)) as u64).max(MIN_CAPACITY)
        };
        Self {
            inner: Mutex::new(Bucket {
                capacity,
                tokens: capacity as f64,
                rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 1.0)
    }

    /// Reconfigures the bucket's rate in place, preserving banked tokens
    /// up to the new capacity. Used when a write supplies a fresh
    /// `bandwidth_limit_bytes_per_sec` (mappings may change it per call).
    pub fn set_rate(&self, rate_per_sec: u64, burst_ratio: f64) {
        let mut bucket = self.inner.lock().unwrap();
        if bucket.rate_per_sec == rate_per_sec {
            return;
        }
        let capacity = if rate_per_sec == 0 {
            u64::MAX
        } else {
            ((rate_per_sec as f64 / burst_ratio.max(0.001)) as u64).max(MIN_CAPACITY)
        };
        bucket.capacity = capacity;
        bucket.tokens = bucket.tokens.min(capacity as f64);
        bucket.rate_per_sec = rate_per_sec;
    }

    fn refill(bucket: &mut Bucket) {
        if bucket.rate_per_sec == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate_per_sec as f64)
            .min(bucket.capacity as f64);
        bucket.last_refill = now;
    }

    /// Blocks until `n` bytes worth of tokens are available, or returns an
    /// error if `cancel` fires first.
    pub async fn acquire(&self, n: u64, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let wait = {
                let mut bucket = self.inner.lock().unwrap();
                Self::refill(&mut bucket);
                if bucket.rate_per_sec == 0 || bucket.tokens >= n as f64 {
                    bucket.tokens -= n.min(bucket.capacity) as f64;
                    return Ok(());
                }
                let deficit = n as f64 - bucket.tokens;
                Duration::from_secs_f64((deficit / bucket.rate_per_sec as f64).max(0.001))
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("token bucket wait cancelled")]
pub struct Cancelled;
