//! Broadcast hub: fans incident/remediation/stats events out to
//! dashboard websocket subscribers.
//!
//! A mutex-guarded map of per-subscriber bounded channels, published to
//! with `try_send` so one slow subscriber can never block the publisher
//! or the rest of the fleet. A subscriber that is full or disconnected
//! is simply dropped from the map on the next publish.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::store::{Incident, RemediationLog, Stats};

/// Per-subscriber outbound queue depth. Bounded so a stalled websocket
/// write can't grow memory without limit.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Typed event envelope sent to every connected dashboard client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Incident(Incident),
    Remediation(RemediationLog),
    Stats(Stats),
}

pub type Subscription = mpsc::Receiver<BroadcastEvent>;

/// Central fan-out point. Cheaply cloneable handles share the same
/// subscriber map via an internal `Arc`-free `Mutex` (the hub itself is
/// always held behind an `Arc` by callers).
#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<BroadcastEvent>>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its id plus the receiving end
    /// of its outbound queue. Callers forward items from the receiver to
    /// a websocket write half.
    pub async fn subscribe(&self) -> (Uuid, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        self.subscribers.lock().await.insert(id, tx);
        debug!(subscriber = %id, "dashboard subscriber connected");
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().await.remove(&id);
        debug!(subscriber = %id, "dashboard subscriber disconnected");
    }

    /// Fan `event` out to every subscriber. Never blocks: a full or
    /// disconnected subscriber is dropped from the map rather than
    /// awaited.
    pub async fn publish(&self, event: BroadcastEvent) {
        let mut guard = self.subscribers.lock().await;
        guard.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = %id, "dropping slow dashboard subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    #[cfg(test)]
    async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Priority;
    use chrono::Utc;

    fn sample_incident() -> Incident {
        Incident {
            id: "inc-1".to_string(),
            fingerprint: "fp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            count: 1,
            namespace: "payments".to_string(),
            pod: "api".to_string(),
            container: "app".to_string(),
            message: "boom".to_string(),
            priority: Priority::P2,
            rule_name: "r".to_string(),
            labels: HashMap::new(),
            raw: "boom".to_string(),
            remediated: false,
            remediated_at: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.subscribe().await;
        hub.publish(BroadcastEvent::Incident(sample_incident())).await;
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, BroadcastEvent::Incident(_)));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_shrinks_map() {
        let hub = Hub::new();
        let (id, _rx) = hub.subscribe().await;
        assert_eq!(hub.subscriber_count().await, 1);
        hub.unsubscribe(id).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let hub = Hub::new();
        let (_id, rx) = hub.subscribe().await;
        drop(rx);
        hub.publish(BroadcastEvent::Incident(sample_incident())).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_rather_than_blocking() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.subscribe().await;
        for _ in 0..SUBSCRIBER_CHANNEL_CAPACITY {
            hub.publish(BroadcastEvent::Incident(sample_incident())).await;
        }
        // one more push should overflow and prune the subscriber
        hub.publish(BroadcastEvent::Incident(sample_incident())).await;
        assert_eq!(hub.subscriber_count().await, 0);
        // draining the channel still yields the buffered events
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, SUBSCRIBER_CHANNEL_CAPACITY);
    }
}
