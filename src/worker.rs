//! Worker pool: claims requests from the Index Store, executes them via an
//! [`HttpExecutor`], and classifies the outcome into completion, retry, or
//! dead-letter.
//!
//! Each worker task runs a poll loop; in-flight executions are tracked in a
//! `tokio::task::JoinSet` so `stop()` can join every outstanding task
//! instead of polling a counter. A separate sweep task periodically
//! recovers orphaned `processing` entries — requests claimed by a worker
//! that crashed or was killed mid-execution, per the janitor's lease-expiry
//! sweep pattern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backpressure::{BackpressureController, Denial};
use crate::circuit_breaker::classify_status;
use crate::durable::DurableStore;
use crate::events::{EngineEvent, EventBus};
use crate::http_executor::HttpExecutor;
use crate::index::{IndexNotification, IndexStore};
use crate::model::{AttemptOutcome, RequestStatus, ResponseSummary, StatusPatch};
use crate::retry::{delay_for, should_retry, JitterSource, RetryConfig, RetryOutcome};

pub struct WorkerPool {
    durable: Arc<dyn DurableStore>,
    index: Arc<dyn IndexStore>,
    backpressure: Arc<BackpressureController>,
    http: Arc<dyn HttpExecutor>,
    events: EventBus,
    jitter: Arc<dyn JitterSource>,
    retry_config: RetryConfig,
    poll_interval: Duration,
    orphan_sweep_multiplier: u32,
    stopping: Arc<AtomicBool>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        durable: Arc<dyn DurableStore>,
        index: Arc<dyn IndexStore>,
        backpressure: Arc<BackpressureController>,
        http: Arc<dyn HttpExecutor>,
        events: EventBus,
        jitter: Arc<dyn JitterSource>,
        retry_config: RetryConfig,
        poll_interval: Duration,
        orphan_sweep_multiplier: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            durable,
            index,
            backpressure,
            http,
            events,
            jitter,
            retry_config,
            poll_interval,
            orphan_sweep_multiplier,
            stopping: Arc::new(AtomicBool::new(false)),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    /// Spawn `worker_count` poll loops plus one orphan-recovery sweep task.
    /// Resets the stop flag so a pool that was previously `stop()`ed (e.g.
    /// by `Engine::pause`) can be restarted.
    pub async fn start(self: &Arc<Self>, worker_count: usize) {
        self.stopping.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for id in 0..worker_count {
            let pool = self.clone();
            tasks.spawn(async move { pool.run_loop(id).await });
        }
        let sweep_pool = self.clone();
        tasks.spawn(async move { sweep_pool.run_sweep_loop().await });
    }

    /// Signal every loop to stop and join them.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    async fn run_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker loop started");
        let mut notifications = self.index.subscribe();
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            self.promote_due().await;

            match self.index.dequeue_priority().await {
                Some(request_id) => {
                    self.process(&request_id).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        recv = notifications.recv() => {
                            if let Ok(IndexNotification::NewRequest { .. } | IndexNotification::Retry { .. }) = recv {
                                // Woken early by a fresh enqueue or matured retry.
                            }
                        }
                    }
                }
            }
        }
        debug!(worker_id, "worker loop stopped");
    }

    async fn promote_due(&self) {
        let promoted = self.index.promote_due(Utc::now()).await;
        for id in promoted {
            self.index.notify(IndexNotification::Retry { request_id: id });
        }
    }

    async fn run_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.poll_interval * 4);
        interval.tick().await;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            interval.tick().await;
            self.sweep_orphans().await;
        }
    }

    /// Requests stuck in `processing` longer than `orphan_sweep_multiplier`
    /// times their own timeout are assumed abandoned by a dead worker and
    /// are returned to the priority set for another attempt.
    async fn sweep_orphans(&self) {
        let orphan_ids = match self.durable.list_orphaned_processing(0).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(err = %e, "failed to list orphaned processing requests");
                return;
            }
        };
        for id in orphan_ids {
            let Ok(Some(request)) = self.durable.get_request(&id).await else {
                continue;
            };
            let Ok(Some(state)) = self.durable.get_request_state(&id).await else {
                continue;
            };
            if state.status != RequestStatus::Processing {
                continue;
            }
            let threshold_ms = request.timeout_ms as i64 * self.orphan_sweep_multiplier as i64;
            let stale = state
                .last_attempt_at
                .map(|t| Utc::now().signed_duration_since(t).num_milliseconds() > threshold_ms)
                .unwrap_or(false);
            if !stale {
                continue;
            }
            warn!(request_id = %id, "recovering orphaned processing request");
            self.index.unmark_processing(&id).await;
            if let Err(e) = self
                .durable
                .patch_request_state(&id, RequestStatus::Pending, StatusPatch::default())
                .await
            {
                warn!(request_id = %id, err = %e, "failed to reset orphaned request state");
                continue;
            }
            self.index.enqueue_priority(&id, request.priority).await;
        }
    }

    async fn process(&self, request_id: &str) {
        let request = match self.durable.get_request(request_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!(request_id, "dequeued request has no durable row — dropping");
                return;
            }
            Err(e) => {
                warn!(request_id, err = %e, "failed to load request");
                return;
            }
        };

        // Late-cancel race: the caller may have cancelled between enqueue
        // and dispatch. Re-check status before doing any network I/O.
        let state = match self.durable.get_request_state(request_id).await {
            Ok(Some(s)) => s,
            _ => return,
        };
        if state.status.is_terminal() {
            return;
        }

        let host = request.host().unwrap_or_else(|| "unknown".to_string());
        let permit = match self.backpressure.admit(&host).await {
            Ok(permit) => permit,
            Err(denial) => {
                self.requeue_after_denial(&request, denial).await;
                return;
            }
        };

        let attempt_number = state.attempts + 1;
        self.index.mark_processing(request_id, Utc::now()).await;
        if let Err(e) = self
            .durable
            .patch_request_state(
                request_id,
                RequestStatus::Processing,
                StatusPatch {
                    attempts: Some(attempt_number),
                    last_attempt_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(request_id, err = %e, "failed to mark request processing");
        }

        let result = self
            .http
            .execute(
                request.method,
                &request.url,
                &request.headers,
                request.body.as_deref(),
                Duration::from_millis(request.timeout_ms),
            )
            .await;

        drop(permit);
        self.index.unmark_processing(request_id).await;

        match result {
            Ok(response) => {
                self.handle_response(&request, attempt_number, &host, response).await;
            }
            Err(message) => {
                self.handle_error(&request, attempt_number, &host, message).await;
            }
        }
    }

    async fn handle_response(
        &self,
        request: &crate::model::Request,
        attempt_number: u32,
        host: &str,
        response: crate::http_executor::HttpResponse,
    ) {
        let breaker = self.backpressure.circuit_breakers().get_or_create(host).await;
        breaker.record_status(response.status_code).await;

        let _ = self
            .durable
            .log_attempt(
                &request.id,
                attempt_number,
                Some(host),
                &AttemptOutcome::Response {
                    status_code: response.status_code,
                    duration_ms: response.duration_ms,
                    response_headers: response.headers.clone(),
                },
            )
            .await;

        if classify_status(response.status_code) {
            self.complete(request, response).await;
        } else {
            let message = format!("http status {}", response.status_code);
            self.fail_and_maybe_retry(request, attempt_number, Some(response.status_code), message).await;
        }
    }

    async fn handle_error(&self, request: &crate::model::Request, attempt_number: u32, host: &str, message: String) {
        let breaker = self.backpressure.circuit_breakers().get_or_create(host).await;
        breaker.record_failure().await;

        let _ = self
            .durable
            .log_attempt(&request.id, attempt_number, Some(host), &AttemptOutcome::Error { message: message.clone() })
            .await;

        self.fail_and_maybe_retry(request, attempt_number, None, message).await;
    }

    async fn complete(&self, request: &crate::model::Request, response: crate::http_executor::HttpResponse) {
        let summary = ResponseSummary {
            status_code: response.status_code,
            duration_ms: response.duration_ms,
            headers: response.headers,
        };
        // Re-check for a late cancel before writing a terminal state — a
        // cancel that raced with this in-flight call must win.
        if let Ok(Some(state)) = self.durable.get_request_state(&request.id).await {
            if state.status == RequestStatus::Cancelled {
                return;
            }
        }
        let _ = self
            .durable
            .patch_request_state(
                &request.id,
                RequestStatus::Completed,
                StatusPatch {
                    completed_at: Some(Some(Utc::now())),
                    response: Some(Some(summary.clone())),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await;
        self.index.purge(&request.id).await;
        info!(request_id = %request.id, status = summary.status_code, "request completed");
        self.events.publish(EngineEvent::Complete {
            request_id: request.id.clone(),
            response: summary,
        });
    }

    async fn fail_and_maybe_retry(
        &self,
        request: &crate::model::Request,
        attempt_number: u32,
        status_code: Option<u16>,
        message: String,
    ) {
        if let Ok(Some(state)) = self.durable.get_request_state(&request.id).await {
            if state.status == RequestStatus::Cancelled {
                return;
            }
        }

        let config = RetryConfig {
            max_attempts: request.max_retries + 1,
            ..self.retry_config.clone()
        };
        let outcome = RetryOutcome { status_code, error: Some(message.as_str()) };

        if should_retry(&config, attempt_number, outcome) {
            let delay = match delay_for(&config, attempt_number, self.jitter.as_ref()) {
                Ok(d) => d,
                Err(e) => {
                    warn!(request_id = %request.id, err = %e, "retry delay computation failed — dead-lettering");
                    self.dead_letter(request, attempt_number, message).await;
                    return;
                }
            };
            let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            let _ = self
                .durable
                .patch_request_state(
                    &request.id,
                    RequestStatus::Failed,
                    StatusPatch {
                        next_retry_at: Some(Some(next_retry_at)),
                        error: Some(Some(message)),
                        ..Default::default()
                    },
                )
                .await;
            self.index
                .enqueue_scheduled(&request.id, request.priority, next_retry_at)
                .await;
            self.events.publish(EngineEvent::Retry {
                request_id: request.id.clone(),
                attempt_number,
                next_retry_at,
            });
        } else {
            self.dead_letter(request, attempt_number, message).await;
        }
    }

    async fn dead_letter(&self, request: &crate::model::Request, attempt_number: u32, message: String) {
        let _ = self
            .durable
            .patch_request_state(
                &request.id,
                RequestStatus::Dead,
                StatusPatch {
                    error: Some(Some(message.clone())),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await;
        self.index.mark_dead(&request.id).await;
        self.index.purge(&request.id).await;
        warn!(request_id = %request.id, attempts = attempt_number, "request moved to dead letter");
        self.events.publish(EngineEvent::Dead {
            request_id: request.id.clone(),
            attempts: attempt_number,
            error: message,
        });
    }

    /// Deliberately reschedules instead of blocking this poll loop in a
    /// 50ms wait-and-retry (the bounded-poll shape used elsewhere): a single
    /// worker loop blocking on one denied request would stall every other
    /// request behind it. Parking the denied id on the scheduled set lets
    /// the loop move on to the next dequeue immediately.
    async fn requeue_after_denial(&self, request: &crate::model::Request, denial: Denial) {
        let delay_ms = match &denial {
            Denial::GlobalConcurrency { .. } | Denial::HostConcurrency { .. } => self.poll_interval.as_millis() as u64,
            Denial::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            Denial::CircuitOpen { retry_after_ms, .. } => *retry_after_ms,
        };
        let at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        self.index.enqueue_scheduled(&request.id, request.priority, at).await;
        debug!(request_id = %request.id, ?delay_ms, "dispatch denied by backpressure — rescheduled");
    }
}
