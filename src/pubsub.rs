//! The `Pubsub` capability (see spec §6): a topic-keyed notification bus.
//!
//! A handler registered via `subscribe_with_err` is invoked with either a
//! message payload or the `DroppedMessages` sentinel, the latter signalling
//! that the subscriber may have missed notifications and must resync. The
//! bundled `LocalPubsub` is an in-process fan-out implementation for tests
//! and single-replica deployments; a real multi-replica deployment would
//! swap in a Postgres LISTEN/NOTIFY or Redis-backed implementation behind
//! the same trait, the way `freeq-server`'s `s2s.rs` keeps origin servers
//! behind a small message-passing surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PubsubError;

pub type Handler = Arc<dyn Fn(Result<&[u8], PubsubError>) + Send + Sync>;

/// A live subscription. Dropping it does not unsubscribe; call `cancel()`
/// explicitly, mirroring the original's `SubscribeWithErr` returning an
/// explicit `CancelFunc` rather than relying on guard semantics.
pub struct Subscription {
    cancel_fn: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    pub fn new(cancel_fn: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel_fn: Box::new(cancel_fn),
        }
    }

    pub fn cancel(self) {
        (self.cancel_fn)()
    }
}

#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubsubError>;

    /// Registers `handler` on `topic`. Returns a `Subscription` that must be
    /// cancelled by the caller to stop receiving messages.
    async fn subscribe_with_err(
        &self,
        topic: &str,
        handler: Handler,
    ) -> Result<Subscription, PubsubError>;
}

struct TopicState {
    handlers: HashMap<u64, Handler>,
}

/// Shared, cheaply-cloneable inner state so that subscriptions can hold a
/// handle back to the bus without requiring callers to go through `Arc<Self>`.
struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    sub_seq: AtomicU64,
}

impl Inner {
    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(state) = topics.get_mut(topic) {
            state.handlers.remove(&id);
        }
    }
}

/// In-process pubsub: `publish` calls every registered handler on `topic`
/// synchronously and in registration order. No network, no persistence — a
/// single-replica stand-in for a real bus.
pub struct LocalPubsub {
    inner: Arc<Inner>,
}

impl LocalPubsub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                sub_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Delivers the dropped-messages sentinel to every handler on `topic`,
    /// simulating a bus-level gap (used by tests exercising resync paths).
    pub fn simulate_drop(&self, topic: &str) {
        let handlers: Vec<Handler> = {
            let topics = self.inner.topics.lock();
            topics
                .get(topic)
                .map(|s| s.handlers.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(Err(PubsubError::DroppedMessages));
        }
    }
}

impl Default for LocalPubsub {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                sub_seq: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl Pubsub for LocalPubsub {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PubsubError> {
        let handlers: Vec<Handler> = {
            let topics = self.inner.topics.lock();
            topics
                .get(topic)
                .map(|s| s.handlers.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(Ok(payload));
        }
        Ok(())
    }

    async fn subscribe_with_err(
        &self,
        topic: &str,
        handler: Handler,
    ) -> Result<Subscription, PubsubError> {
        let id = self.inner.sub_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = self.inner.topics.lock();
            let state = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState {
                    handlers: HashMap::new(),
                });
            state.handlers.insert(id, handler);
        }
        let inner = self.inner.clone();
        let topic = topic.to_string();
        Ok(Subscription::new(move || inner.unsubscribe(&topic, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_invokes_subscribed_handler() {
        let bus = LocalPubsub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let sub = bus
            .subscribe_with_err(
                "topic",
                Arc::new(move |msg| {
                    assert_eq!(msg.unwrap(), b"hello");
                    c2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        bus.publish("topic", b"hello").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sub.cancel();
        bus.publish("topic", b"hello").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_messages_sentinel_is_delivered() {
        let bus = LocalPubsub::new();
        let saw_drop = Arc::new(AtomicUsize::new(0));
        let s2 = saw_drop.clone();
        let _sub = bus
            .subscribe_with_err(
                "topic",
                Arc::new(move |msg| {
                    if matches!(msg, Err(PubsubError::DroppedMessages)) {
                        s2.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();
        bus.simulate_drop("topic");
        assert_eq!(saw_drop.load(Ordering::SeqCst), 1);
    }
}
