//! Bandwidth throttling
//!
//! A token bucket where one token is one byte. The sync engine consults it
//! before every read so a run honours the network limit from its limits file.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket rate limiter
///
/// - Tokens are added at a fixed rate (refill_rate per second)
/// - Tokens accumulate up to max_tokens (burst capacity)
/// - Each operation consumes tokens
#[derive(Debug)]
pub struct TokenBucket {
    /// Current token count (scaled by 1000 for sub-token precision)
    tokens: AtomicU64,
    /// Maximum tokens (burst capacity), scaled
    max_tokens: u64,
    /// Tokens added per second, scaled
    refill_rate: u64,
    last_refill: Mutex<Instant>,
    scale: u64,
}

/// Sub-token precision of the counters
const SCALE: u64 = 1000;

impl TokenBucket {
    /// Largest rate or burst a bucket can represent; larger values are clamped
    pub const MAX_RATE: u64 = u64::MAX / SCALE;

    /// Create a bucket refilling `rate` tokens per second, holding at most `burst`
    pub fn new(rate: u64, burst: u64) -> Self {
        let scale = SCALE;
        let rate = rate.clamp(1, Self::MAX_RATE);
        let burst = burst.clamp(1, Self::MAX_RATE);
        Self {
            tokens: AtomicU64::new(burst * scale),
            max_tokens: burst * scale,
            refill_rate: rate * scale,
            last_refill: Mutex::new(Instant::now()),
            scale,
        }
    }

    /// Bucket for a bytes-per-second limit with one second of burst
    pub fn per_second(bytes: u64) -> Self {
        Self::new(bytes, bytes)
    }

    /// Try to acquire tokens without waiting
    pub fn try_acquire(&self, count: u64) -> bool {
        self.refill();

        let needed = count.saturating_mul(self.scale);
        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < needed {
                return false;
            }

            match self.tokens.compare_exchange_weak(
                current,
                current - needed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Wait until `count` tokens have been consumed. Requests larger than the
    /// burst are taken in burst-sized pieces.
    pub async fn acquire(&self, count: u64) {
        let burst = self.max_tokens / self.scale;
        let mut remaining = count;
        while remaining > 0 {
            let take = remaining.min(burst);
            while !self.try_acquire(take) {
                tokio::time::sleep(self.wait_for(take)).await;
            }
            remaining -= take;
        }
    }

    /// Current token count
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) / self.scale
    }

    fn wait_for(&self, count: u64) -> Duration {
        let needed = count.saturating_mul(self.scale);
        let current = self.tokens.load(Ordering::Relaxed);
        let deficit = needed.saturating_sub(current);
        let micros = deficit.saturating_mul(1_000_000) / self.refill_rate;
        Duration::from_micros(micros.max(1000))
    }

    /// Refill tokens based on elapsed time
    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last);

        let new_tokens = (elapsed.as_micros() * self.refill_rate as u128 / 1_000_000)
            .min(self.max_tokens as u128) as u64;

        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let new_value = current.saturating_add(new_tokens).min(self.max_tokens);
            self.tokens.store(new_value, Ordering::Relaxed);
            *last = now;
        }
    }
}
