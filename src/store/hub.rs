//! In-process fan-out of change events to filtered subscribers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::{ChangeEvent, ChangeKind, ChangeStream, Collection, Filter, StoreResult};

struct Subscriber {
    collection: Collection,
    filter: Filter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        if event.collection != self.collection {
            return false;
        }
        // `old` and deleted rows may carry only their key columns
        match event.kind {
            ChangeKind::Insert => self.filter.matches(&event.row),
            ChangeKind::Delete => self.filter.may_match(&event.row),
            // Rows leaving the filter are delivered too, so views can drop them
            ChangeKind::Update => {
                self.filter.matches(&event.row)
                    || event.old.as_ref().is_some_and(|old| self.filter.may_match(old))
            }
        }
    }
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// Dispatches published events to every subscriber whose filter matches.
#[derive(Clone, Default)]
pub struct ChangeHub {
    inner: Arc<HubInner>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|id, sub| {
            if !sub.wants(&event) {
                return true;
            }
            let delivered = sub.tx.send(event.clone()).is_ok();
            if !delivered {
                tracing::debug!(subscription_id = id, "Dropping closed subscriber");
            }
            delivered
        });
    }

    /// End every open subscription. Readers see their stream finish and
    /// must subscribe again; events published before the call are still
    /// delivered.
    pub fn close_all(&self) -> usize {
        let closed: Vec<Subscriber> = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.drain().map(|(_, sub)| sub).collect()
        };
        if !closed.is_empty() {
            tracing::warn!(subscriptions = closed.len(), "Closing all change subscriptions");
        }
        closed.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn register(&self, collection: Collection, filter: Filter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                collection,
                filter,
                tx,
            },
        );
        tracing::debug!(subscription_id = id, collection = %collection, "Subscribed to changes");

        Subscription {
            guard: SubscriptionGuard {
                id,
                hub: Arc::downgrade(&self.inner),
            },
            receiver,
        }
    }
}

#[async_trait]
impl ChangeStream for ChangeHub {
    async fn subscribe(&self, collection: Collection, filter: Filter) -> StoreResult<Subscription> {
        Ok(self.register(collection, filter))
    }
}

/// Releases the subscription when dropped.
pub struct SubscriptionGuard {
    id: u64,
    hub: Weak<HubInner>,
}

impl SubscriptionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().remove(&self.id);
            tracing::debug!(subscription_id = self.id, "Unsubscribed from changes");
        }
    }
}

/// A live subscription: events arrive in publish order and buffer until read.
pub struct Subscription {
    guard: SubscriptionGuard,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.guard.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Split so the guard can be released independently of the reader.
    pub fn into_parts(self) -> (SubscriptionGuard, mpsc::UnboundedReceiver<ChangeEvent>) {
        (self.guard, self.receiver)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_only_matching_rows() {
        let hub = ChangeHub::new();
        let mut sub = hub.register(Collection::Bids, Filter::eq("task_id", "t1"));

        hub.publish(ChangeEvent::insert(Collection::Bids, json!({ "id": "a", "task_id": "t2" })));
        hub.publish(ChangeEvent::insert(Collection::Tasks, json!({ "id": "b", "task_id": "t1" })));
        hub.publish(ChangeEvent::insert(Collection::Bids, json!({ "id": "c", "task_id": "t1" })));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.row["id"], "c");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn updates_leaving_the_filter_are_delivered() {
        let hub = ChangeHub::new();
        let mut sub = hub.register(Collection::Tasks, Filter::eq("status", "OPEN"));

        hub.publish(ChangeEvent::update(
            Collection::Tasks,
            json!({ "id": "t", "status": "IN_PROGRESS" }),
            Some(json!({ "id": "t", "status": "OPEN" })),
        ));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn slim_deletes_reach_filters_on_missing_columns() {
        let hub = ChangeHub::new();
        let mut sub = hub.register(
            Collection::Tasks,
            Filter::eq("status", "OPEN").and(Filter::contains("description", "lexer")),
        );

        hub.publish(ChangeEvent::delete(Collection::Tasks, json!({ "id": "t", "status": "DONE" })));
        hub.publish(ChangeEvent::delete(Collection::Tasks, json!({ "id": "u", "status": "OPEN" })));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.row["id"], "u");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_all_ends_every_stream_after_draining() {
        let hub = ChangeHub::new();
        let mut sub = hub.register(Collection::Bids, Filter::everything());
        hub.publish(ChangeEvent::insert(Collection::Bids, json!({ "id": "a" })));

        assert_eq!(hub.close_all(), 1);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.recv().await.expect("buffered").row["id"], "a");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropping_the_subscription_unregisters_it() {
        let hub = ChangeHub::new();
        let sub = hub.register(Collection::Messages, Filter::everything());
        let other = hub.register(Collection::Messages, Filter::everything());
        assert_eq!(hub.subscriber_count(), 2);

        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(), 1);

        let (guard, _rx) = other.into_parts();
        drop(guard);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
