//! Queue Manager: the public entry point every embedder talks to.
//!
//! Owns every subsystem, validates input, and exposes the operations a
//! caller needs (enqueue, inspect, cancel, pause/resume, dead-letter
//! retry) without leaking the Durable Store, Index Store or worker pool
//! abstractions. Mirrors the daemon's `AppContext` — one `Arc`-wrapped field
//! per subsystem behind a cloneable handle — generalized from a struct the
//! RPC layer reaches into, to a struct that *is* the library's API surface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backpressure::BackpressureController;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::config::EngineConfig;
use crate::durable::{DurableStore, SqliteDurableStore};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::http_executor::{HttpExecutor, ReqwestExecutor};
use crate::index::{IndexNotification, IndexStore, InMemoryIndexStore};
use crate::model::{
    Method, Request, RequestInput, RequestStatus, RequestState, Stats, DEFAULT_MAX_RETRIES,
    DEFAULT_PRIORITY, DEFAULT_TIMEOUT_MS,
};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{JitterSource, RandomJitter, RetryConfig, RetryOn, RetryStrategy};
use crate::worker::WorkerPool;

const MAX_URL_LEN: usize = 8192;
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The durable/index backpressure state returned by `get_backpressure_state`.
#[derive(Debug, Clone)]
pub struct BackpressureState {
    pub global_in_flight: u32,
    pub circuit_breakers: Vec<(String, crate::circuit_breaker::CircuitState)>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    http: Option<Arc<dyn HttpExecutor>>,
    durable: Option<Arc<dyn DurableStore>>,
    jitter: Option<Arc<dyn JitterSource>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            http: None,
            durable: None,
            jitter: None,
        }
    }

    pub fn with_http_executor(mut self, http: Arc<dyn HttpExecutor>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_durable_store(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_jitter_source(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub async fn build(self) -> EngineResult<Engine> {
        let durable: Arc<dyn DurableStore> = match self.durable {
            Some(d) => d,
            None => Arc::new(SqliteDurableStore::new(&self.config.data_dir, self.config.max_connections).await?),
        };
        let http = self.http.unwrap_or_else(|| Arc::new(ReqwestExecutor::new()));
        let jitter = self.jitter.unwrap_or_else(|| Arc::new(RandomJitter));

        Engine::new(self.config, durable, http, jitter).await
    }
}

/// The durable, distributed HTTP request queue's public API.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    durable: Arc<dyn DurableStore>,
    index: Arc<dyn IndexStore>,
    backpressure: Arc<BackpressureController>,
    events: EventBus,
    workers: Arc<WorkerPool>,
    paused: Arc<AtomicBool>,
}

impl Engine {
    async fn new(
        config: EngineConfig,
        durable: Arc<dyn DurableStore>,
        http: Arc<dyn HttpExecutor>,
        jitter: Arc<dyn JitterSource>,
    ) -> EngineResult<Self> {
        let index: Arc<dyn IndexStore> = Arc::new(InMemoryIndexStore::new());
        let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity: config.rate_limit_capacity as f64,
            refill_per_sec: config.rate_limit_refill_per_sec,
        }));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            success_threshold: 2,
            reset_timeout: std::time::Duration::from_millis(config.circuit_reset_timeout_ms),
            half_open_max_requests: config.circuit_half_open_max_requests,
        }));
        let backpressure = Arc::new(BackpressureController::new(&config, rate_limiter, circuit_breakers));
        let events = EventBus::new();

        let retry_config = RetryConfig {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            base_delay: std::time::Duration::from_millis(config.base_retry_delay_ms),
            max_delay: std::time::Duration::from_millis(config.max_retry_delay_ms),
            multiplier: 2.0,
            strategy: RetryStrategy::Exponential,
            custom_delay: None,
            jitter: true,
            retry_on: RetryOn::Default,
        };

        let workers = WorkerPool::new(
            durable.clone(),
            index.clone(),
            backpressure.clone(),
            http,
            events.clone(),
            jitter,
            retry_config,
            std::time::Duration::from_millis(config.poll_interval_ms),
            config.orphan_sweep_multiplier,
        );

        Ok(Self {
            config,
            durable,
            index,
            backpressure,
            events,
            workers,
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start the worker pool. Idempotent only in the sense that calling it
    /// twice spawns a second set of workers — callers should call this once.
    pub async fn start(&self) {
        if !self.paused.load(Ordering::SeqCst) {
            self.workers.start(self.config.worker_count).await;
        }
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.workers.stop().await;
        Ok(())
    }

    /// Stop the worker pool without touching the Index Store — anything
    /// already parked in the priority or scheduled sets stays there and
    /// will dispatch again once `resume()` restarts the workers. Does not
    /// abort whatever an in-flight request is mid-execution.
    pub async fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.workers.stop().await;
        }
    }

    pub async fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.workers.start(self.config.worker_count).await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn validate(input: &RequestInput) -> EngineResult<()> {
        if input.url.is_empty() {
            return Err(EngineError::Validation("url must not be empty".into()));
        }
        if input.url.len() > MAX_URL_LEN {
            return Err(EngineError::Validation(format!("url exceeds {MAX_URL_LEN} bytes")));
        }
        if !input.url.starts_with("http://") && !input.url.starts_with("https://") {
            return Err(EngineError::Validation("url must be absolute http(s)".into()));
        }
        if let Some(body) = &input.body {
            if body.len() > MAX_BODY_BYTES {
                return Err(EngineError::Validation(format!("body exceeds {MAX_BODY_BYTES} bytes")));
            }
        }
        if let Some(p) = input.priority {
            if p > 100 {
                return Err(EngineError::Validation("priority must be 0-100".into()));
            }
        }
        Ok(())
    }

    fn resolve(input: RequestInput) -> Request {
        Request {
            id: input.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            url: input.url,
            method: input.method,
            headers: input.headers,
            body: input.body,
            priority: input.priority.unwrap_or(DEFAULT_PRIORITY),
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            timeout_ms: input.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            scheduled_for: input.scheduled_for,
            metadata: input.metadata,
            created_at: Utc::now(),
        }
    }

    pub async fn enqueue(&self, input: RequestInput) -> EngineResult<String> {
        if self.paused.load(Ordering::SeqCst) {
            return Err(EngineError::Paused);
        }
        Self::validate(&input)?;
        let request = Self::resolve(input);
        let id = request.id.clone();

        let (status, notification) = match request.scheduled_for {
            Some(at) if at > Utc::now() => (RequestStatus::Scheduled, None),
            _ => (RequestStatus::Pending, Some(())),
        };

        self.durable.create_request(&request, status).await?;

        if notification.is_some() {
            self.index.enqueue_priority(&id, request.priority).await;
            self.index.notify(IndexNotification::NewRequest { request_id: id.clone() });
        } else if let Some(at) = request.scheduled_for {
            self.index.enqueue_scheduled(&id, request.priority, at).await;
        }

        Ok(id)
    }

    /// Validate and enqueue a batch in one durable transaction — either
    /// every request lands or none do, so a validation or id-conflict
    /// failure partway through never leaves earlier items committed. Fires
    /// a single `IndexNotification::Batch` for the requests ready for
    /// immediate dispatch, rather than one notification per item.
    pub async fn enqueue_many(&self, inputs: Vec<RequestInput>) -> EngineResult<Vec<String>> {
        if self.paused.load(Ordering::SeqCst) {
            return Err(EngineError::Paused);
        }
        for input in &inputs {
            Self::validate(input)?;
        }

        let requests: Vec<Request> = inputs.into_iter().map(Self::resolve).collect();
        let now = Utc::now();
        let rows: Vec<(Request, RequestStatus)> = requests
            .iter()
            .map(|r| {
                let status = match r.scheduled_for {
                    Some(at) if at > now => RequestStatus::Scheduled,
                    _ => RequestStatus::Pending,
                };
                (r.clone(), status)
            })
            .collect();

        self.durable.create_requests(&rows).await?;

        let mut ready_count = 0;
        for (request, status) in &rows {
            match status {
                RequestStatus::Pending => {
                    self.index.enqueue_priority(&request.id, request.priority).await;
                    ready_count += 1;
                }
                RequestStatus::Scheduled => {
                    let at = request.scheduled_for.unwrap_or(now);
                    self.index.enqueue_scheduled(&request.id, request.priority, at).await;
                }
                _ => unreachable!("enqueue_many only produces Pending or Scheduled rows"),
            }
        }
        if ready_count > 0 {
            self.index.notify(IndexNotification::Batch { count: ready_count });
        }

        Ok(requests.into_iter().map(|r| r.id).collect())
    }

    pub async fn get_status(&self, request_id: &str) -> EngineResult<RequestState> {
        self.durable
            .get_request_state(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(request_id.to_string()))
    }

    /// Cancel a request still sitting in `priority` or `scheduled`. Returns
    /// `true` if it was found and cancelled, `false` if it was already
    /// terminal or already claimed by a worker — requests in `processing`
    /// are never cancelled, matching the Index Store's `cancel` contract.
    /// A second call on an already-cancelled id also returns `false`, which
    /// is a normal outcome, not an error.
    pub async fn cancel(&self, request_id: &str) -> EngineResult<bool> {
        let state = self
            .durable
            .get_request_state(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(request_id.to_string()))?;
        if state.status.is_terminal() {
            return Ok(false);
        }
        if !self.index.cancel(request_id).await {
            return Ok(false);
        }
        self.durable
            .patch_request_state(
                request_id,
                RequestStatus::Cancelled,
                crate::model::StatusPatch {
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        self.events.publish(EngineEvent::Cancelled {
            request_id: request_id.to_string(),
        });
        Ok(true)
    }

    pub async fn get_stats(&self) -> EngineResult<Stats> {
        self.durable.get_stats().await
    }

    pub async fn get_backpressure_state(&self) -> BackpressureState {
        BackpressureState {
            global_in_flight: self.backpressure.global_in_flight(),
            circuit_breakers: self.backpressure.circuit_breakers().snapshot().await,
        }
    }

    pub async fn get_dead_letter_requests(&self, limit: i64) -> EngineResult<Vec<Request>> {
        self.durable.list_dead_requests(limit).await
    }

    /// Re-queue a dead request for another attempt. Resets the attempt
    /// counter to 0 — the next attempt will again be logged as attempt
    /// number 1, producing a second `attempts` row with that number. The
    /// durable store has no unique constraint on `(request_id,
    /// attempt_number)` for exactly this reason; `created_at` disambiguates.
    pub async fn retry_dead_request(&self, request_id: &str) -> EngineResult<()> {
        let state = self
            .durable
            .get_request_state(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(request_id.to_string()))?;
        if state.status != RequestStatus::Dead {
            return Err(EngineError::Validation(format!(
                "request {request_id} is not dead (status: {})",
                state.status
            )));
        }
        let request = self
            .durable
            .get_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(request_id.to_string()))?;

        self.durable
            .patch_request_state(
                request_id,
                RequestStatus::Pending,
                crate::model::StatusPatch {
                    attempts: Some(0),
                    next_retry_at: Some(None),
                    completed_at: Some(None),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.index.unmark_dead(request_id).await;
        self.index.enqueue_priority(request_id, request.priority).await;
        self.index.notify(IndexNotification::Retry {
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Delete terminal requests older than `days`, completed/cancelled and
    /// dead alike. Returns the total row count removed across both.
    pub async fn prune(&self, days: u32) -> EngineResult<u64> {
        let completed = self.durable.cleanup_completed(days).await?;
        let dead = self.durable.cleanup_dead(days).await?;
        Ok(completed + dead)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir.clone()
    }
}

/// Convenience constructor for a GET request input with defaults applied.
pub fn get(url: impl Into<String>) -> RequestInput {
    RequestInput {
        id: None,
        url: url.into(),
        method: Method::Get,
        headers: Default::default(),
        body: None,
        priority: None,
        max_retries: None,
        timeout_ms: None,
        scheduled_for: None,
        metadata: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_executor::fake::{err, ok, FakeExecutor};
    use std::time::Duration;

    async fn test_engine(responses: Vec<Result<crate::http_executor::HttpResponse, String>>) -> Engine {
        let config = EngineConfig {
            poll_interval_ms: 5,
            worker_count: 1,
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..EngineConfig::default()
        };
        EngineBuilder::new(config)
            .with_durable_store(Arc::new(crate::durable::SqliteDurableStore::in_memory().await.unwrap()))
            .with_http_executor(Arc::new(FakeExecutor::new(responses)))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_url() {
        let engine = test_engine(vec![]).await;
        let mut input = get("");
        input.method = Method::Get;
        let result = engine.enqueue(input).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn enqueue_rejects_relative_url() {
        let engine = test_engine(vec![]).await;
        let result = engine.enqueue(get("/just/a/path")).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn successful_request_completes() {
        let engine = test_engine(vec![ok(200)]).await;
        engine.start().await;

        let id = engine.enqueue(get("https://example.com/ok")).await.unwrap();

        let mut state = engine.get_status(&id).await.unwrap();
        for _ in 0..50 {
            if state.status == RequestStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = engine.get_status(&id).await.unwrap();
        }
        assert_eq!(state.status, RequestStatus::Completed);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_dead_letter() {
        let engine = test_engine(vec![err("boom"), err("boom"), err("boom"), err("boom")]).await;
        engine.start().await;

        let mut input = get("https://example.com/fail");
        input.max_retries = Some(3);
        let id = engine.enqueue(input).await.unwrap();

        let mut state = engine.get_status(&id).await.unwrap();
        for _ in 0..100 {
            if state.status == RequestStatus::Dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = engine.get_status(&id).await.unwrap();
        }
        assert_eq!(state.status, RequestStatus::Dead);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_prevents_dispatch() {
        let engine = test_engine(vec![]).await;
        let id = engine.enqueue(get("https://example.com/never")).await.unwrap();
        assert!(engine.cancel(&id).await.unwrap());
        let state = engine.get_status(&id).await.unwrap();
        assert_eq!(state.status, RequestStatus::Cancelled);

        assert!(!engine.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_many_dispatches_every_item() {
        let engine = test_engine(vec![ok(200), ok(200), ok(200)]).await;
        engine.start().await;

        let ids = engine
            .enqueue_many(vec![
                get("https://example.com/a"),
                get("https://example.com/b"),
                get("https://example.com/c"),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        for id in &ids {
            let mut state = engine.get_status(id).await.unwrap();
            for _ in 0..50 {
                if state.status == RequestStatus::Completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                state = engine.get_status(id).await.unwrap();
            }
            assert_eq!(state.status, RequestStatus::Completed);
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_many_rolls_back_on_duplicate_id() {
        let engine = test_engine(vec![]).await;
        let mut dup = get("https://example.com/dup");
        dup.id = Some("fixed-id".to_string());

        let mut clashing = get("https://example.com/also-dup");
        clashing.id = Some("fixed-id".to_string());

        let result = engine.enqueue_many(vec![dup, clashing]).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn retry_dead_request_allows_redispatch() {
        let engine = test_engine(vec![err("boom"), ok(200)]).await;

        let mut input = get("https://example.com/flaky");
        input.max_retries = Some(0);
        let id = engine.enqueue(input).await.unwrap();
        engine.start().await;

        let mut state = engine.get_status(&id).await.unwrap();
        for _ in 0..50 {
            if state.status == RequestStatus::Dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = engine.get_status(&id).await.unwrap();
        }
        assert_eq!(state.status, RequestStatus::Dead);

        engine.retry_dead_request(&id).await.unwrap();

        let mut state = engine.get_status(&id).await.unwrap();
        for _ in 0..50 {
            if state.status == RequestStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = engine.get_status(&id).await.unwrap();
        }
        assert_eq!(state.status, RequestStatus::Completed);
        engine.shutdown().await.unwrap();
    }
}
