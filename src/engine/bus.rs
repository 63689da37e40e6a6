//! Typed publish/subscribe bus for lifecycle events.
//!
//! Subscribers receive events over an unbounded channel, optionally filtered
//! by event kind. The subscriber registry tolerates concurrent subscribe,
//! unsubscribe, and publish; `clear` drops every subscription at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::domain::{EventKind, WorkflowEvent};

/// Identifier of an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscriber {
    /// Deliver only these kinds; `None` means all.
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

/// Event bus with per-subscriber delivery channels.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<SubscriptionId, Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<WorkflowEvent>) {
        self.subscribe_inner(None)
    }

    /// Subscribe to a specific set of event kinds.
    pub fn subscribe_to(
        &self,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<WorkflowEvent>) {
        self.subscribe_inner(Some(kinds.into_iter().collect()))
    }

    fn subscribe_inner(
        &self,
        kinds: Option<HashSet<EventKind>>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(Uuid::new_v4());
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, Subscriber { kinds, tx });
        (id, rx)
    }

    /// Remove a subscription; safe to call for an already-removed id.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    /// Deliver an event to every interested subscriber, at most once each.
    ///
    /// Subscribers whose receiver has been dropped are pruned lazily on the
    /// next publish.
    pub fn publish(&self, event: WorkflowEvent) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
            for (id, subscriber) in subscribers.iter() {
                if let Some(ref kinds) = subscriber.kinds {
                    if !kinds.contains(&event.kind) {
                        continue;
                    }
                }
                if subscriber.tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().expect("subscriber lock poisoned");
            for id in dead {
                subscribers.remove(&id);
            }
        }

        trace!(kind = ?event.kind, run_id = %event.run_id, "published event");
    }

    /// Drop every subscription. Idempotent.
    pub fn clear(&self) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .clear();
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(kind: EventKind) -> WorkflowEvent {
        WorkflowEvent::run_scoped(Uuid::new_v4(), kind, "test")
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();

        bus.publish(event(EventKind::WorkflowStarted));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::WorkflowStarted);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_to([EventKind::StepFailed]);

        bus.publish(event(EventKind::StepStarted));
        bus.publish(event(EventKind::StepFailed));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::StepFailed);
        assert!(rx.try_recv().is_err(), "filtered event must not arrive");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();

        bus.unsubscribe(id);
        bus.publish(event(EventKind::WorkflowStarted));

        assert!(rx.recv().await.is_none(), "channel should be closed");
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let bus = EventBus::new();
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe_to([EventKind::StepCompleted]);
        assert_eq!(bus.subscription_count(), 2);

        bus.clear();
        assert_eq!(bus.subscription_count(), 0);

        bus.clear();
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        drop(rx);

        bus.publish(event(EventKind::WorkflowStarted));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_publish() {
        let bus = EventBus::new();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let (id, _rx) = bus.subscribe();
                bus.publish(event(EventKind::StepStarted));
                bus.unsubscribe(id);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(bus.subscription_count(), 0);
    }
}
