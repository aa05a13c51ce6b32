// SPDX-License-Identifier: MIT
//! Per-host circuit breaker.
//!
//! Protects downstream hosts from cascading failures: once a host fails
//! repeatedly the breaker opens and requests fail fast instead of tying up
//! workers waiting for timeouts.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(success_threshold successes)──── HalfOpen ◄─(timeout elapsed)──┘
//! ```
//!
//! - **Closed**: all calls allowed, failures counted.
//! - **Open**: calls rejected immediately. After `reset_timeout` elapses,
//!   transitions to HalfOpen to test recovery.
//! - **HalfOpen**: up to `half_open_max_requests` probes allowed through at
//!   once. Enough successes close the circuit; any failure reopens it.
//!
//! A breaker only ever transitions on `record_success`/`record_failure`
//! calls driven by actual HTTP outcomes — see [`classify`] for which status
//! codes count as which.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens. Default: 5.
    pub failure_threshold: u32,
    /// Consecutive successes (from HalfOpen) before the circuit closes. Default: 2.
    pub success_threshold: u32,
    /// How long the circuit stays Open before a probe is allowed. Default: 30s.
    pub reset_timeout: Duration,
    /// How many concurrent probe requests HalfOpen allows through. Default: 1.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Classifies an HTTP status code as success or failure for breaker
/// purposes. 5xx and 429 count as failures even though they are valid HTTP
/// responses — a breaker that only reacts to transport errors never opens
/// against a server that responds but is unhealthy.
pub fn classify_status(status_code: u16) -> bool {
    !(status_code >= 500 || status_code == 429)
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            last_failure: None,
        }
    }
}

/// A single host's breaker. Cheaply cloneable — clones share state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<CircuitBreakerConfig>,
    host: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            config: Arc::new(config),
            host: Arc::from(host.into().as_str()),
        }
    }

    /// Returns `true` if a call should be attempted, and if so reserves a
    /// probe slot when in HalfOpen.
    pub async fn is_allowed(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return true,
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_requests {
                        drop(inner);
                        let mut inner = self.inner.write().await;
                        if inner.state == CircuitState::HalfOpen
                            && inner.half_open_in_flight < self.config.half_open_max_requests
                        {
                            inner.half_open_in_flight += 1;
                            return true;
                        }
                        return false;
                    }
                    return false;
                }
                CircuitState::Open => {
                    if let Some(last_failure) = inner.last_failure {
                        if last_failure.elapsed() < self.config.reset_timeout {
                            return false;
                        }
                    } else {
                        return true;
                    }
                }
            }
        }

        // Upgrade to write lock to transition Open → HalfOpen.
        let mut inner = self.inner.write().await;
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure {
                if last_failure.elapsed() >= self.config.reset_timeout {
                    info!(host = %self.host, "circuit breaker -> half_open (probe)");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 1;
                    return true;
                }
            }
        }
        inner.state != CircuitState::Open
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(host = %self.host, "circuit breaker -> closed (recovered)");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_in_flight = 0;
                    inner.last_failure = None;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(host = %self.host, failures = inner.failure_count, "circuit breaker -> open (threshold reached)");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(host = %self.host, "circuit breaker -> open (probe failed)");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record an outcome by HTTP status code, applying [`classify_status`].
    pub async fn record_status(&self, status_code: u16) {
        if classify_status(status_code) {
            self.record_success().await;
        } else {
            self.record_failure().await;
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Milliseconds until the circuit will allow a probe, or 0 if it
    /// already would.
    pub async fn retry_after_ms(&self) -> u64 {
        let inner = self.inner.read().await;
        if inner.state != CircuitState::Open {
            return 0;
        }
        match inner.last_failure {
            Some(last) => {
                let remaining = self.config.reset_timeout.saturating_sub(last.elapsed());
                remaining.as_millis() as u64
            }
            None => 0,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("host", &self.host).finish()
    }
}

/// Registry of per-host breakers, created lazily on first use. Mirrors the
/// account pool's `RwLock<HashMap<..>>` shape — reads are the common case,
/// writes only happen the first time a host is seen.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn get_or_create(&self, host: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.read().await.get(host) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(host.to_string())
            .or_insert_with(|| CircuitBreaker::new(host, self.config.clone()))
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.read().await;
        let mut out = Vec::with_capacity(breakers.len());
        for (host, cb) in breakers.iter() {
            out.push((host.clone(), cb.state().await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            half_open_max_requests: 1,
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.is_allowed().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await); // first probe reserves the only slot
        assert!(!cb.is_allowed().await); // second probe denied until the first resolves
    }

    #[tokio::test]
    async fn closes_after_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reopens_on_probe_failure() {
        let cb = CircuitBreaker::new("api.example.com", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn classify_status_treats_5xx_and_429_as_failures() {
        assert!(!classify_status(500));
        assert!(!classify_status(503));
        assert!(!classify_status(429));
        assert!(classify_status(200));
        assert!(classify_status(404));
    }

    #[tokio::test]
    async fn registry_returns_same_breaker_for_same_host() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        let a = registry.get_or_create("host-a").await;
        a.record_failure().await;
        let a_again = registry.get_or_create("host-a").await;
        assert_eq!(a_again.failure_count().await, 1);

        let b = registry.get_or_create("host-b").await;
        assert_eq!(b.failure_count().await, 0);
    }
}
