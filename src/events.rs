//! Engine event dispatch.
//!
//! Subscribers get notified of request lifecycle transitions over a
//! `tokio::sync::broadcast` channel rather than a sequential callback list —
//! a slow or panicking subscriber can't stall delivery to the others, and
//! each subscription is just a receiver any task can own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::ResponseSummary;

/// All distinct lifecycle transitions the engine reports to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    Complete {
        request_id: String,
        response: ResponseSummary,
    },
    Error {
        request_id: String,
        attempt_number: u32,
        error: String,
    },
    Retry {
        request_id: String,
        attempt_number: u32,
        next_retry_at: DateTime<Utc>,
    },
    Dead {
        request_id: String,
        attempts: u32,
        error: String,
    },
    Cancelled {
        request_id: String,
    },
}

impl EngineEvent {
    pub fn request_id(&self) -> &str {
        match self {
            EngineEvent::Complete { request_id, .. }
            | EngineEvent::Error { request_id, .. }
            | EngineEvent::Retry { request_id, .. }
            | EngineEvent::Dead { request_id, .. }
            | EngineEvent::Cancelled { request_id } => request_id,
        }
    }
}

/// Broadcasts `EngineEvent`s to all connected subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. Returns the number of receivers it was delivered
    /// to — zero is fine, it just means nobody is listening right now.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::Complete {
            request_id: "r1".to_string(),
            response: ResponseSummary {
                status_code: 200,
                duration_ms: 5,
                headers: Default::default(),
            },
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.request_id(), "r1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        let delivered = bus.publish(EngineEvent::Cancelled { request_id: "r2".to_string() });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineEvent::Cancelled { request_id: "r3".to_string() });

        assert_eq!(rx1.recv().await.unwrap().request_id(), "r3");
        assert_eq!(rx2.recv().await.unwrap().request_id(), "r3");
    }
}
