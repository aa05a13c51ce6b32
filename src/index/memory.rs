use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};

use super::{IndexNotification, IndexStore};

#[derive(Debug, Clone)]
struct PriorityEntry {
    request_id: String,
    priority: u8,
    enqueued_at: DateTime<Utc>,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first, FIFO within a tier.
        self.priority
            .cmp(&other.priority)
            .then(other.enqueued_at.cmp(&self.enqueued_at))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for PriorityEntry {}

#[derive(Debug, Clone)]
struct ScheduledEntry {
    request_id: String,
    priority: u8,
    at: DateTime<Utc>,
}

struct State {
    priority: BinaryHeap<PriorityEntry>,
    scheduled: Vec<ScheduledEntry>,
    processing: HashMap<String, DateTime<Utc>>,
    dead: HashSet<String>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
}

/// Default-process Index Store: a priority heap, a scheduled list swept for
/// due entries, a processing map for orphan detection, and a dead set.
/// Guarded by a single mutex — the data structures are small and every
/// operation is O(log n) or better, so lock contention is not a concern at
/// the scale a single process dispatches.
pub struct InMemoryIndexStore {
    state: Mutex<State>,
    notify_tx: broadcast::Sender<IndexNotification>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                priority: BinaryHeap::new(),
                scheduled: Vec::new(),
                processing: HashMap::new(),
                dead: HashSet::new(),
                locks: HashMap::new(),
            }),
            notify_tx,
        }
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn enqueue_priority(&self, request_id: &str, priority: u8) {
        let mut state = self.state.lock().await;
        state.priority.push(PriorityEntry {
            request_id: request_id.to_string(),
            priority,
            enqueued_at: Utc::now(),
        });
    }

    async fn dequeue_priority(&self) -> Option<String> {
        self.state.lock().await.priority.pop().map(|e| e.request_id)
    }

    async fn priority_len(&self) -> usize {
        self.state.lock().await.priority.len()
    }

    async fn enqueue_scheduled(&self, request_id: &str, priority: u8, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.scheduled.push(ScheduledEntry {
            request_id: request_id.to_string(),
            priority,
            at,
        });
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut due = Vec::new();
        state.scheduled.retain(|entry| {
            if entry.at <= now {
                due.push(entry.clone());
                false
            } else {
                true
            }
        });
        let mut promoted = Vec::with_capacity(due.len());
        for entry in due {
            state.priority.push(PriorityEntry {
                request_id: entry.request_id.clone(),
                priority: entry.priority,
                enqueued_at: now,
            });
            promoted.push(entry.request_id);
        }
        promoted
    }

    async fn scheduled_len(&self) -> usize {
        self.state.lock().await.scheduled.len()
    }

    async fn mark_processing(&self, request_id: &str, claimed_at: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .processing
            .insert(request_id.to_string(), claimed_at);
    }

    async fn unmark_processing(&self, request_id: &str) {
        self.state.lock().await.processing.remove(request_id);
    }

    async fn processing_len(&self) -> usize {
        self.state.lock().await.processing.len()
    }

    async fn orphaned_processing(&self, now: DateTime<Utc>, older_than_ms: i64) -> Vec<String> {
        let state = self.state.lock().await;
        let cutoff = chrono::Duration::milliseconds(older_than_ms);
        state
            .processing
            .iter()
            .filter(|(_, claimed_at)| now.signed_duration_since(**claimed_at) > cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn mark_dead(&self, request_id: &str) {
        self.state.lock().await.dead.insert(request_id.to_string());
    }

    async fn unmark_dead(&self, request_id: &str) {
        self.state.lock().await.dead.remove(request_id);
    }

    async fn dead_ids(&self) -> Vec<String> {
        self.state.lock().await.dead.iter().cloned().collect()
    }

    async fn purge(&self, request_id: &str) {
        // Deliberately leaves the dead set untouched — a dead request stays
        // listed until the engine explicitly retries it.
        let mut state = self.state.lock().await;
        state.priority = state
            .priority
            .drain()
            .filter(|e| e.request_id != request_id)
            .collect();
        state.scheduled.retain(|e| e.request_id != request_id);
        state.processing.remove(request_id);
    }

    async fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let priority_before = state.priority.len();
        state.priority = state.priority.drain().filter(|e| e.request_id != request_id).collect();
        let removed_priority = state.priority.len() != priority_before;

        let scheduled_before = state.scheduled.len();
        state.scheduled.retain(|e| e.request_id != request_id);
        let removed_scheduled = state.scheduled.len() != scheduled_before;

        removed_priority || removed_scheduled
    }

    async fn acquire_lock(&self, resource: &str, ttl_ms: u64) -> Option<String> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some((_, expires_at)) = state.locks.get(resource) {
            if *expires_at > now {
                return None;
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = now + chrono::Duration::milliseconds(ttl_ms as i64);
        state.locks.insert(resource.to_string(), (token.clone(), expires_at));
        Some(token)
    }

    async fn release_lock(&self, resource: &str, token: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.locks.get(resource) {
            Some((held_token, _)) if held_token == token => {
                state.locks.remove(resource);
                true
            }
            _ => false,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<IndexNotification> {
        self.notify_tx.subscribe()
    }

    fn notify(&self, event: IndexNotification) {
        // No subscribers is fine — dispatch loops poll regardless of notifications.
        let _ = self.notify_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeues_highest_priority_first() {
        let store = InMemoryIndexStore::new();
        store.enqueue_priority("low", 10).await;
        store.enqueue_priority("high", 90).await;
        store.enqueue_priority("mid", 50).await;

        assert_eq!(store.dequeue_priority().await, Some("high".to_string()));
        assert_eq!(store.dequeue_priority().await, Some("mid".to_string()));
        assert_eq!(store.dequeue_priority().await, Some("low".to_string()));
        assert_eq!(store.dequeue_priority().await, None);
    }

    #[tokio::test]
    async fn ties_broken_fifo() {
        let store = InMemoryIndexStore::new();
        store.enqueue_priority("first", 50).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.enqueue_priority("second", 50).await;

        assert_eq!(store.dequeue_priority().await, Some("first".to_string()));
        assert_eq!(store.dequeue_priority().await, Some("second".to_string()));
    }

    #[tokio::test]
    async fn promote_due_moves_matured_entries() {
        let store = InMemoryIndexStore::new();
        let now = Utc::now();
        store.enqueue_scheduled("past", 50, now - chrono::Duration::seconds(1)).await;
        store.enqueue_scheduled("future", 50, now + chrono::Duration::seconds(60)).await;

        let promoted = store.promote_due(now).await;
        assert_eq!(promoted, vec!["past".to_string()]);
        assert_eq!(store.scheduled_len().await, 1);
        assert_eq!(store.dequeue_priority().await, Some("past".to_string()));
    }

    #[tokio::test]
    async fn orphaned_processing_detects_stale_claims() {
        let store = InMemoryIndexStore::new();
        let claimed_at = Utc::now() - chrono::Duration::seconds(120);
        store.mark_processing("stuck", claimed_at).await;
        store.mark_processing("fresh", Utc::now()).await;

        let orphans = store.orphaned_processing(Utc::now(), 60_000).await;
        assert_eq!(orphans, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn purge_clears_priority_scheduled_and_processing_but_not_dead() {
        let store = InMemoryIndexStore::new();
        store.enqueue_priority("x", 10).await;
        store.mark_processing("x", Utc::now()).await;
        store.mark_dead("x").await;

        store.purge("x").await;

        assert_eq!(store.priority_len().await, 0);
        assert_eq!(store.processing_len().await, 0);
        assert_eq!(store.dead_ids().await, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn cancel_removes_from_priority_and_scheduled_not_processing() {
        let store = InMemoryIndexStore::new();
        store.enqueue_priority("a", 10).await;
        store.enqueue_scheduled("b", 10, Utc::now() + chrono::Duration::seconds(30)).await;
        store.mark_processing("c", Utc::now()).await;

        assert!(store.cancel("a").await);
        assert!(store.cancel("b").await);
        assert!(!store.cancel("c").await);
        assert!(!store.cancel("unknown").await);

        assert_eq!(store.priority_len().await, 0);
        assert_eq!(store.scheduled_len().await, 0);
        assert_eq!(store.processing_len().await, 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = InMemoryIndexStore::new();
        let token = store.acquire_lock("dead-letter-replay", 60_000).await.unwrap();
        assert!(store.acquire_lock("dead-letter-replay", 60_000).await.is_none());

        assert!(!store.release_lock("dead-letter-replay", "wrong-token").await);
        assert!(store.release_lock("dead-letter-replay", &token).await);

        assert!(store.acquire_lock("dead-letter-replay", 60_000).await.is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = InMemoryIndexStore::new();
        store.acquire_lock("resource", 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.acquire_lock("resource", 60_000).await.is_some());
    }
}
