//! Two-scope token-bucket rate limiter.
//!
//! A single global bucket is checked first; on success, a per-host bucket
//! is checked second (skipped when the caller doesn't name a host). Host
//! buckets are deliberately smaller than the global one — `rate =
//! ceil(global_rate / 10)`, `burst = ceil(global_burst / 5)` — so one noisy
//! host can't alone consume the whole global allowance. Buckets are created
//! lazily on first use, same as the circuit breaker registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_sec: 10.0,
        }
    }
}

fn derive_host_config(global: &RateLimiterConfig) -> RateLimiterConfig {
    RateLimiterConfig {
        capacity: (global.capacity / 5.0).ceil().max(1.0),
        refill_per_sec: (global.refill_per_sec / 10.0).ceil().max(1.0),
    }
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl Bucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Utc::now(),
        }
    }

    fn refill(&mut self, config: &RateLimiterConfig, now: DateTime<Utc>) {
        let elapsed_secs = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        if elapsed_secs > 0.0 {
            self.tokens = (self.tokens + elapsed_secs * config.refill_per_sec).min(config.capacity);
            self.last_refill = now;
        }
    }

    fn denial_after(&self, config: &RateLimiterConfig) -> u64 {
        let deficit = 1.0 - self.tokens;
        let wait_secs = deficit / config.refill_per_sec;
        (wait_secs * 1000.0).ceil().max(0.0) as u64
    }
}

/// Outcome of an `acquire` call.
#[derive(Debug, Clone, Copy)]
pub enum AcquireResult {
    Allowed,
    Denied { retry_after_ms: u64 },
}

/// A global bucket plus a registry of per-host buckets derived from it.
pub struct RateLimiter {
    global: Mutex<Bucket>,
    global_config: RateLimiterConfig,
    host_buckets: Mutex<HashMap<String, Bucket>>,
    host_config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let host_config = derive_host_config(&config);
        Self {
            global: Mutex::new(Bucket::new(config.capacity)),
            global_config: config,
            host_buckets: Mutex::new(HashMap::new()),
            host_config,
        }
    }

    /// Consume a global token, then (if `host` is given) a host token.
    /// Denial at either scope refunds any token already taken and returns
    /// the wait until that scope's next token refills.
    pub async fn acquire(&self, host: Option<&str>) -> AcquireResult {
        let now = Utc::now();
        {
            let mut global = self.global.lock().await;
            global.refill(&self.global_config, now);
            if global.tokens < 1.0 {
                return AcquireResult::Denied {
                    retry_after_ms: global.denial_after(&self.global_config),
                };
            }
            global.tokens -= 1.0;
        }

        let Some(host) = host else {
            return AcquireResult::Allowed;
        };

        let mut buckets = self.host_buckets.lock().await;
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| Bucket::new(self.host_config.capacity));
        bucket.refill(&self.host_config, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            AcquireResult::Allowed
        } else {
            let retry_after_ms = bucket.denial_after(&self.host_config);
            drop(buckets);
            let mut global = self.global.lock().await;
            global.tokens = (global.tokens + 1.0).min(self.global_config.capacity);
            AcquireResult::Denied { retry_after_ms }
        }
    }

    /// Backward-compatible convenience for call sites that always have a host.
    pub async fn try_acquire(&self, host: &str) -> AcquireResult {
        self.acquire(Some(host)).await
    }

    /// Return a token to `host`'s bucket without waiting for refill — used
    /// when a claimed slot turns out not to need a network call after all.
    pub async fn release(&self, host: &str) {
        let mut buckets = self.host_buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(host) {
            bucket.tokens = (bucket.tokens + 1.0).min(self.host_config.capacity);
        }
    }

    pub async fn available_tokens(&self, host: &str) -> f64 {
        let now = Utc::now();
        let mut buckets = self.host_buckets.lock().await;
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| Bucket::new(self.host_config.capacity));
        bucket.refill(&self.host_config, now);
        bucket.tokens
    }

    pub async fn available_global_tokens(&self) -> f64 {
        let now = Utc::now();
        let mut global = self.global.lock().await;
        global.refill(&self.global_config, now);
        global.tokens
    }
}

pub type SharedRateLimiter = Arc<RateLimiter>;

/// Parse a `Retry-After` response header into milliseconds: an integer
/// number of seconds, or an HTTP-date (RFC 7231 / RFC 2822).
pub fn parse_retry_after_ms(header_value: &str) -> Option<u64> {
    let trimmed = header_value.trim();

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(secs * 1000);
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(trimmed) {
        let now = Utc::now();
        let retry_at = dt.with_timezone(&Utc);
        if retry_at > now {
            return Some(retry_at.signed_duration_since(now).num_milliseconds().max(0) as u64);
        }
        return Some(0);
    }

    None
}
