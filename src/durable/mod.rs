//! Durable Store: the source of truth for request and attempt history.
//!
//! Defined as a trait so a Postgres (or other SQL) backend can be swapped in
//! later without touching engine logic — the only shipped implementation is
//! SQLite, matching the daemon's own storage layer.

mod migrations;
mod sqlite;

pub use sqlite::SqliteDurableStore;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::model::{Attempt, AttemptOutcome, Request, RequestState, RequestStatus, Stats, StatusPatch};

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a new request row plus its initial `RequestState` (status
    /// `pending` or `scheduled`, attempts 0). `EngineError::Conflict` if a
    /// row with this id already exists.
    async fn create_request(&self, request: &Request, initial_status: RequestStatus) -> EngineResult<()>;

    /// Insert many requests in a single transaction — either all rows land
    /// or none do. Used by `Engine::enqueue_many` so a validation or
    /// uniqueness failure partway through never leaves a partial batch
    /// durably committed.
    async fn create_requests(&self, requests: &[(Request, RequestStatus)]) -> EngineResult<()>;

    async fn get_request(&self, id: &str) -> EngineResult<Option<Request>>;

    /// Requests filtered by `status` and/or a substring match against the
    /// request URL (used as a stand-in for a host filter), newest first.
    async fn get_requests_by_status(
        &self,
        status: Option<RequestStatus>,
        host_contains: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<Request>>;

    async fn get_request_state(&self, id: &str) -> EngineResult<Option<RequestState>>;

    /// Apply a partial update to a request's state, bumping `updated_at`.
    async fn patch_request_state(&self, id: &str, status: RequestStatus, patch: StatusPatch) -> EngineResult<()>;

    /// Append an attempt row. `attempt_number` is supplied by the caller
    /// (the Worker), not derived from a COUNT, so a retried-after-dead
    /// request can legitimately restart numbering at 1.
    async fn log_attempt(&self, request_id: &str, attempt_number: u32, host: Option<&str>, outcome: &AttemptOutcome) -> EngineResult<()>;

    async fn list_attempts(&self, request_id: &str) -> EngineResult<Vec<Attempt>>;

    async fn list_dead_requests(&self, limit: i64) -> EngineResult<Vec<Request>>;

    /// Requests stuck in `processing` whose `last_attempt_at` is older than
    /// `older_than_ms`. Used by the worker's orphan-recovery sweep.
    async fn list_orphaned_processing(&self, older_than_ms: i64) -> EngineResult<Vec<String>>;

    async fn get_stats(&self) -> EngineResult<Stats>;

    /// Delete completed/cancelled requests older than `days`. `0` disables.
    async fn cleanup_completed(&self, days: u32) -> EngineResult<u64>;

    /// Delete dead requests older than `days`. `0` disables.
    async fn cleanup_dead(&self, days: u32) -> EngineResult<u64>;
}
