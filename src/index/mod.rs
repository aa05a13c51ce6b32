//! Index Store: the fast, in-process queue abstraction the worker pool
//! actually dispatches from. The Durable Store is the source of truth across
//! restarts; the Index Store is the hot structure workers poll.
//!
//! Only an in-memory implementation ships today — the trait seam exists so a
//! shared backend (e.g. Redis) could replace it for multi-process
//! deployments without touching `Worker`/`Engine`.

mod memory;

pub use memory::InMemoryIndexStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Notification payload pushed to subscribers when the priority set gains a
/// new entry (fresh enqueue, or a scheduled/retry item becoming due).
#[derive(Debug, Clone)]
pub enum IndexNotification {
    NewRequest { request_id: String },
    Retry { request_id: String },
    /// A batch of requests entered the priority set together, via
    /// `Engine::enqueue_many`. Carries the count rather than every id so a
    /// waiting poll loop can wake once instead of once per item.
    Batch { count: usize },
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Push a request into the priority set, ready for immediate dispatch.
    async fn enqueue_priority(&self, request_id: &str, priority: u8);

    /// Pop the highest-priority request id (ties broken FIFO), if any.
    async fn dequeue_priority(&self) -> Option<String>;

    async fn priority_len(&self) -> usize;

    /// Park a request until `at`; `promote_due` moves matured entries to the
    /// priority set.
    async fn enqueue_scheduled(&self, request_id: &str, priority: u8, at: DateTime<Utc>);

    /// Move any scheduled entries whose time has passed into the priority
    /// set, firing a `Retry` or `NewRequest` notification for each.
    async fn promote_due(&self, now: DateTime<Utc>) -> Vec<String>;

    async fn scheduled_len(&self) -> usize;

    /// Mark a request as in-flight, recording when the claim was made (used
    /// by the orphan-recovery sweep).
    async fn mark_processing(&self, request_id: &str, claimed_at: DateTime<Utc>);

    async fn unmark_processing(&self, request_id: &str);

    async fn processing_len(&self) -> usize;

    /// Entries that have been in `processing` longer than `older_than_ms`.
    async fn orphaned_processing(&self, now: DateTime<Utc>, older_than_ms: i64) -> Vec<String>;

    async fn mark_dead(&self, request_id: &str);

    async fn unmark_dead(&self, request_id: &str);

    async fn dead_ids(&self) -> Vec<String>;

    /// Remove a request id from the priority, scheduled and processing sets
    /// (the dead set is untouched — a dead request stays listed until
    /// explicitly retried). Used after a successful completion or dead
    /// lettering, where the request is known to no longer need dispatch.
    async fn purge(&self, request_id: &str);

    /// Atomically remove a request id from the priority and scheduled sets
    /// only — `processing` is left untouched, so a request already claimed
    /// by a worker can't be cancelled out from under it. Returns whether the
    /// id was found in either set.
    async fn cancel(&self, request_id: &str) -> bool;

    /// Short-lived, compare-and-delete exclusive lock. Not used on the
    /// request hot path today (the in-memory store's own mutex already
    /// serializes compound operations) — it exists for future callers that
    /// need to coordinate an exclusive section across components, e.g. a
    /// manual dead-letter replay tool running alongside the engine.
    /// Returns a unique token on success, `None` if already held and unexpired.
    async fn acquire_lock(&self, resource: &str, ttl_ms: u64) -> Option<String>;

    /// Release a lock previously acquired with the matching token. Returns
    /// `false` if the token doesn't match the current holder (including the
    /// case where the lock already expired and was taken by someone else).
    async fn release_lock(&self, resource: &str, token: &str) -> bool;

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<IndexNotification>;

    fn notify(&self, event: IndexNotification);
}
