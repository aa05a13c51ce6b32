//! Backpressure controller: composes concurrency limits, the rate limiter
//! and the circuit breaker registry into a single admission check the
//! worker consults before dispatching a request.
//!
//! Tries each gate in sequence and returns the first denial reason,
//! mirroring the provider-fallback engine's try-primary-then-alternatives
//! shape — except here every gate must pass rather than any one succeeding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::rate_limiter::{AcquireResult, RateLimiter};

/// Why a dispatch attempt was denied.
#[derive(Debug, Clone)]
pub enum Denial {
    GlobalConcurrency { limit: u32 },
    HostConcurrency { host: String, limit: u32 },
    RateLimited { host: String, retry_after_ms: u64 },
    CircuitOpen { host: String, retry_after_ms: u64 },
}

/// An admission grant. Holding this reserves a global + per-host
/// concurrency slot; dropping it releases both.
pub struct Permit {
    controller: Arc<BackpressureInner>,
    host: String,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.controller.release(&self.host);
    }
}

struct BackpressureInner {
    global_in_flight: AtomicU32,
    host_in_flight: RwLock<HashMap<String, u32>>,
    max_concurrent_global: u32,
    max_concurrent_per_host: u32,
}

impl BackpressureInner {
    fn release(&self, host: &str) {
        self.global_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut map) = self.host_in_flight.try_write() {
            if let Some(count) = map.get_mut(host) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Composes all three throttles behind one `admit()` call.
pub struct BackpressureController {
    inner: Arc<BackpressureInner>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
}

impl BackpressureController {
    pub fn new(config: &EngineConfig, rate_limiter: Arc<RateLimiter>, circuit_breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            inner: Arc::new(BackpressureInner {
                global_in_flight: AtomicU32::new(0),
                host_in_flight: RwLock::new(HashMap::new()),
                max_concurrent_global: config.max_concurrent_global,
                max_concurrent_per_host: config.max_concurrent_per_host,
            }),
            rate_limiter,
            circuit_breakers,
        }
    }

    /// Try to admit a dispatch for `host`. Returns a `Permit` that must be
    /// held for the lifetime of the in-flight request, or a `Denial`
    /// describing the first gate that rejected it.
    pub async fn admit(&self, host: &str) -> Result<Permit, Denial> {
        if self.inner.global_in_flight.load(Ordering::SeqCst) >= self.inner.max_concurrent_global {
            return Err(Denial::GlobalConcurrency {
                limit: self.inner.max_concurrent_global,
            });
        }

        {
            let map = self.inner.host_in_flight.read().await;
            if map.get(host).copied().unwrap_or(0) >= self.inner.max_concurrent_per_host {
                return Err(Denial::HostConcurrency {
                    host: host.to_string(),
                    limit: self.inner.max_concurrent_per_host,
                });
            }
        }

        let breaker = self.circuit_breakers.get_or_create(host).await;
        if !breaker.is_allowed().await {
            return Err(Denial::CircuitOpen {
                host: host.to_string(),
                retry_after_ms: breaker.retry_after_ms().await,
            });
        }

        match self.rate_limiter.try_acquire(host).await {
            AcquireResult::Denied { retry_after_ms } => {
                return Err(Denial::RateLimited {
                    host: host.to_string(),
                    retry_after_ms,
                });
            }
            AcquireResult::Allowed => {}
        }

        self.inner.global_in_flight.fetch_add(1, Ordering::SeqCst);
        *self.inner.host_in_flight.write().await.entry(host.to_string()).or_insert(0) += 1;

        Ok(Permit {
            controller: self.inner.clone(),
            host: host.to_string(),
        })
    }

    pub fn global_in_flight(&self) -> u32 {
        self.inner.global_in_flight.load(Ordering::SeqCst)
    }

    pub async fn host_in_flight(&self, host: &str) -> u32 {
        self.inner.host_in_flight.read().await.get(host).copied().unwrap_or(0)
    }

    /// Exposes the circuit breaker registry so the worker can record an
    /// outcome after doing the I/O `admit()` only gated.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::rate_limiter::RateLimiterConfig;

    fn controller(max_global: u32, max_host: u32) -> BackpressureController {
        let mut cfg = EngineConfig::default();
        cfg.max_concurrent_global = max_global;
        cfg.max_concurrent_per_host = max_host;
        BackpressureController::new(
            &cfg,
            Arc::new(RateLimiter::new(RateLimiterConfig {
                capacity: 1000.0,
                refill_per_sec: 1000.0,
            })),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        )
    }

    #[tokio::test]
    async fn admits_under_limit_and_releases_on_drop() {
        let c = controller(10, 10);
        let permit = c.admit("host-a").await.unwrap();
        assert_eq!(c.global_in_flight(), 1);
        drop(permit);
        assert_eq!(c.global_in_flight(), 0);
    }

    #[tokio::test]
    async fn denies_when_host_concurrency_exceeded() {
        let c = controller(10, 1);
        let _permit = c.admit("host-a").await.unwrap();
        let denial = c.admit("host-a").await;
        assert!(matches!(denial, Err(Denial::HostConcurrency { .. })));
    }

    #[tokio::test]
    async fn denies_when_global_concurrency_exceeded() {
        let c = controller(1, 10);
        let _permit = c.admit("host-a").await.unwrap();
        let denial = c.admit("host-b").await;
        assert!(matches!(denial, Err(Denial::GlobalConcurrency { .. })));
    }

    #[tokio::test]
    async fn different_hosts_do_not_share_concurrency_slots() {
        let c = controller(10, 1);
        let _a = c.admit("host-a").await.unwrap();
        let b = c.admit("host-b").await;
        assert!(b.is_ok());
    }
}
