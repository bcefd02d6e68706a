//! Token-bucket rate limiting: one bucket per api key, one global ceiling,
//! and optional per-provider QPS buckets consulted by workers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rpm: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rpm as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant, weight: f64) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.refill_per_sec <= 0.0 {
            return Err(Duration::from_secs(60));
        }
        if self.tokens >= weight {
            self.tokens -= weight;
            return Ok(());
        }
        let deficit = weight - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<TokenBucket>,
    per_key: Mutex<HashMap<String, TokenBucket>>,
    per_provider: Mutex<HashMap<String, TokenBucket>>,
}

/// Denial carries the wait until the bucket refills one token, rounded up
/// for the `Retry-After` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAfter {
    pub seconds: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = TokenBucket::new(config.global_rpm, config.burst.max(config.global_rpm / 10));
        Self {
            config,
            global: Mutex::new(global),
            per_key: Mutex::new(HashMap::new()),
            per_provider: Mutex::new(HashMap::new()),
        }
    }

    /// Intake gate. `key` is (key id, per-key rpm override) when the caller
    /// presented an api key; anonymous traffic shares the global bucket only.
    pub fn try_acquire(&self, key: Option<(&str, Option<u32>)>) -> Result<(), RetryAfter> {
        let now = Instant::now();
        if let Some((key_id, rpm)) = key {
            let rpm = rpm.unwrap_or(self.config.default_rpm);
            let mut per_key = self.per_key.lock().expect("rate limiter lock");
            let bucket = per_key
                .entry(key_id.to_string())
                .or_insert_with(|| TokenBucket::new(rpm, self.config.burst));
            if let Err(wait) = bucket.try_acquire(now, 1.0) {
                return Err(retry_after(wait));
            }
        }
        let mut global = self.global.lock().expect("rate limiter lock");
        if let Err(wait) = global.try_acquire(now, 1.0) {
            return Err(retry_after(wait));
        }
        Ok(())
    }

    /// Per-provider QPS gate, consulted right before dispatch. Providers
    /// without a configured rpm are never throttled here.
    pub fn try_acquire_provider(&self, provider: &str, rpm: Option<u32>) -> bool {
        let Some(rpm) = rpm else {
            return true;
        };
        let now = Instant::now();
        let mut per_provider = self.per_provider.lock().expect("rate limiter lock");
        let bucket = per_provider
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(rpm, self.config.burst));
        bucket.try_acquire(now, 1.0).is_ok()
    }
}

fn retry_after(wait: Duration) -> RetryAfter {
    RetryAfter {
        seconds: wait.as_secs_f64().ceil().max(1.0) as u64,
    }
}
