//! In-process relay bus over `tokio::sync::broadcast`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use support_tunnel_core::traits::{BusEvent, RelayBus, Subscription};
use tokio::sync::broadcast::{self, error::RecvError};

/// Frames buffered per topic before slow subscribers start losing them.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Published {
    origin: u64,
    body: String,
}

type Topics = Arc<Mutex<HashMap<String, broadcast::Sender<Arc<Published>>>>>;

/// In-process relay.
///
/// Every clone made with [`LocalRelay::endpoint`] is a distinct peer: a peer
/// never receives the frames it published itself. Frames published on a
/// topic without subscribers are dropped, and a subscriber that falls more
/// than the topic capacity behind loses the oldest frames and is told so
/// through [`BusEvent::Error`].
///
/// Subscribing spawns a forwarding task, so it must happen inside a tokio
/// runtime.
#[derive(Clone)]
pub struct LocalRelay {
    topics: Topics,
    origin: u64,
    next_origin: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    /// Create a relay with the default per-topic buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a relay buffering `capacity` frames per topic.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            origin: 0,
            next_origin: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// A new peer on the same relay.
    #[must_use]
    pub fn endpoint(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
            origin: self.next_origin.fetch_add(1, Ordering::Relaxed),
            next_origin: Arc::clone(&self.next_origin),
            capacity: self.capacity,
        }
    }

    /// Number of topics with at least one live subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn receiver(&self, topic: &str) -> broadcast::Receiver<Arc<Published>> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

fn prune(topics: &Topics, topic: &str) {
    let mut topics = topics.lock().unwrap_or_else(PoisonError::into_inner);
    if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
        topics.remove(topic);
    }
}

impl RelayBus for LocalRelay {
    fn publish(&self, topic: &str, frame: String) {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(tx) => {
                let _ = tx.send(Arc::new(Published {
                    origin: self.origin,
                    body: frame,
                }));
            }
            None => tracing::trace!(topic = %topic, "No subscribers, frame dropped"),
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (events, cancel, subscription) = Subscription::channel(topic);
        let mut rx = self.receiver(topic);
        let _ = events.send(BusEvent::Status(true));

        let origin = self.origin;
        let topics = Arc::clone(&self.topics);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = rx.recv() => next,
                };
                let event = match next {
                    Ok(published) if published.origin == origin => continue,
                    Ok(published) => BusEvent::Message(published.body.clone()),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(topic = %topic, missed, "Subscriber lagged, frames dropped");
                        BusEvent::Error(format!("{missed} frames dropped"))
                    }
                    Err(RecvError::Closed) => break,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            drop(rx);
            prune(&topics, &topic);
        });

        subscription
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_message(sub: &mut Subscription) -> String {
        match tokio::time::timeout(Duration::from_secs(1), sub.next()).await {
            Ok(Some(BusEvent::Message(frame))) => frame,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_then_ordered_messages() {
        let relay = LocalRelay::new();
        let (publisher, subscriber) = (relay.endpoint(), relay.endpoint());

        let mut sub = subscriber.subscribe("support:a");
        assert_eq!(sub.next().await, Some(BusEvent::Status(true)));

        for i in 0..5 {
            publisher.publish("support:a", format!("frame-{i}"));
        }
        for i in 0..5 {
            assert_eq!(next_message(&mut sub).await, format!("frame-{i}"));
        }
    }

    #[tokio::test]
    async fn test_publisher_does_not_hear_itself() {
        let relay = LocalRelay::new();
        let (a, b) = (relay.endpoint(), relay.endpoint());

        let mut sub_a = a.subscribe("support:a");
        let mut sub_b = b.subscribe("support:a");
        sub_a.confirmed(Duration::from_secs(1)).await.unwrap();
        sub_b.confirmed(Duration::from_secs(1)).await.unwrap();

        a.publish("support:a", "from-a".into());
        b.publish("support:a", "from-b".into());

        assert_eq!(next_message(&mut sub_a).await, "from-b");
        assert_eq!(next_message(&mut sub_b).await, "from-a");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let relay = LocalRelay::new();
        let (publisher, subscriber) = (relay.endpoint(), relay.endpoint());

        let mut sub = subscriber.subscribe("support:a");
        sub.confirmed(Duration::from_secs(1)).await.unwrap();
        let _other = subscriber.subscribe("support:b");

        publisher.publish("support:b", "wrong".into());
        publisher.publish("support:a", "right".into());
        assert_eq!(next_message(&mut sub).await, "right");
    }

    #[tokio::test]
    async fn test_no_persistence_for_late_subscribers() {
        let relay = LocalRelay::new();
        let (publisher, subscriber) = (relay.endpoint(), relay.endpoint());

        publisher.publish("support:a", "missed".into());

        let mut sub = subscriber.subscribe("support:a");
        sub.confirmed(Duration::from_secs(1)).await.unwrap();
        publisher.publish("support:a", "seen".into());
        assert_eq!(next_message(&mut sub).await, "seen");
    }

    #[tokio::test]
    async fn test_gap_is_not_redelivered() {
        let relay = LocalRelay::new();
        let (publisher, subscriber) = (relay.endpoint(), relay.endpoint());

        let sub = subscriber.subscribe("support:a");
        sub.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish("support:a", "during-gap".into());

        let mut sub = subscriber.subscribe("support:a");
        sub.confirmed(Duration::from_secs(1)).await.unwrap();
        publisher.publish("support:a", "after-gap".into());
        assert_eq!(next_message(&mut sub).await, "after-gap");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_error() {
        let relay = LocalRelay::with_capacity(2);
        let (publisher, subscriber) = (relay.endpoint(), relay.endpoint());

        let mut sub = subscriber.subscribe("support:a");
        for i in 0..10 {
            publisher.publish("support:a", format!("frame-{i}"));
        }

        assert_eq!(sub.next().await, Some(BusEvent::Status(true)));
        let mut saw_error = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), sub.next()).await {
            if matches!(event, BusEvent::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_unsubscribe_prunes_topic() {
        let relay = LocalRelay::new();
        let sub = relay.endpoint().subscribe("support:a");
        assert_eq!(relay.topic_count(), 1);

        sub.unsubscribe();
        for _ in 0..50 {
            if relay.topic_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("topic was not pruned");
    }
}
