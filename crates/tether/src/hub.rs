//! Live event fan-out.
//!
//! The hub is the store's live-notification side: every event appended to the
//! log is broadcast here immediately after its cursor is assigned. Subscribers
//! register with a scope (everything, or one thread) and get an unbounded
//! channel; a subscriber whose channel is gone is pruned on the next
//! broadcast.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;

use tether_protocol::{RuntimeEvent, StreamEvent};

/// What slice of the event stream a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    AllThreads,
    Thread(String),
}

impl Scope {
    fn matches(&self, event: &RuntimeEvent) -> bool {
        match self {
            Self::AllThreads => true,
            Self::Thread(id) => event.thread_id.as_deref() == Some(id),
        }
    }
}

pub type SubscriberId = u64;

struct Subscriber {
    scope: Scope,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: DashMap<SubscriberId, Subscriber>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The receiver is unbounded so a slow consumer
    /// never blocks the broadcast path.
    pub fn subscribe(&self, scope: Scope) -> (SubscriberId, mpsc::UnboundedReceiver<StreamEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, Subscriber { scope, tx });
        debug!("hub subscriber {} registered", id);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
        debug!("hub subscriber {} removed", id);
    }

    /// Deliver one persisted event to every matching subscriber.
    pub fn broadcast(&self, event: &RuntimeEvent) {
        let stream_event = StreamEvent::from_event(event);
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.scope.matches(event) {
                continue;
            }
            if entry.tx.send(stream_event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(cursor: i64, thread_id: Option<&str>, method: &str) -> RuntimeEvent {
        RuntimeEvent {
            cursor,
            thread_id: thread_id.map(str::to_string),
            turn_id: None,
            method: method.to_string(),
            payload: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn all_threads_scope_sees_everything() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe(Scope::AllThreads);

        hub.broadcast(&event(1, Some("t1"), "turn/started"));
        hub.broadcast(&event(2, None, "account/updated"));

        assert_eq!(rx.recv().await.unwrap().cursor, 1);
        assert_eq!(rx.recv().await.unwrap().cursor, 2);
    }

    #[tokio::test]
    async fn thread_scope_filters_other_threads() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe(Scope::Thread("t1".to_string()));

        hub.broadcast(&event(1, Some("t2"), "turn/started"));
        hub.broadcast(&event(2, Some("t1"), "turn/started"));
        hub.broadcast(&event(3, None, "account/updated"));

        assert_eq!(rx.recv().await.unwrap().cursor, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let (_keep, _rx_keep) = hub.subscribe(Scope::AllThreads);
        let (_gone, rx_gone) = hub.subscribe(Scope::AllThreads);
        drop(rx_gone);

        hub.broadcast(&event(1, None, "account/updated"));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let hub = EventHub::new();
        let (id, _rx) = hub.subscribe(Scope::AllThreads);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
