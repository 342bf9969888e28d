//! Core traits for the session store and the relay bus.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    error::TunnelError,
    protocol::Envelope,
    session::{DeviceHint, Session, SessionId, SessionUpdate, TransitionError},
};

/// Filter for [`SessionStore::list_active`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions opened by this requester.
    pub requester_id: Option<String>,
    /// Only sessions joined by this operator.
    pub operator_id: Option<String>,
    /// Limit results.
    pub limit: Option<usize>,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable record of session identity and lifecycle.
///
/// Implementations must apply [`SessionUpdate`]s through [`Session::apply`]
/// under their own serialization so concurrent joins resolve to one winner.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new waiting session.
    async fn create(&self, requester_id: &str, device: DeviceHint) -> Result<Session, StoreError>;

    /// Get a session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Apply a lifecycle update, returning the updated record.
    async fn update(&self, id: SessionId, update: SessionUpdate) -> Result<Session, StoreError>;

    /// Sessions that are not closed, newest first.
    async fn list_active(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError>;
}

/// What a subscriber observes on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A published frame.
    Message(String),
    /// Subscription became live (`true`) or was lost (`false`).
    Status(bool),
    /// Subscribe failure, timeout, or dropped messages.
    Error(String),
}

/// Live subscription to one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    events: mpsc::UnboundedReceiver<BusEvent>,
    pending: VecDeque<BusEvent>,
    _guard: DropGuard,
}

impl Subscription {
    /// Create a subscription and the handles a bus implementation feeds it with.
    ///
    /// The bus pushes events into the sender and stops delivering once the
    /// token is cancelled, which happens when the subscription is dropped.
    #[must_use]
    pub fn channel(
        topic: impl Into<String>,
    ) -> (mpsc::UnboundedSender<BusEvent>, CancellationToken, Self) {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sub = Self {
            topic: topic.into(),
            events,
            pending: VecDeque::new(),
            _guard: cancel.clone().drop_guard(),
        };
        (tx, cancel, sub)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the bus has dropped this subscription.
    pub async fn next(&mut self) -> Option<BusEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        self.events.recv().await
    }

    /// Wait until the bus confirms the subscription.
    ///
    /// Frames that arrive before the confirmation are kept for [`Self::next`].
    ///
    /// # Errors
    /// Returns [`TunnelError::Session`] on a bus error, a closed subscription,
    /// or when `timeout` elapses first.
    pub async fn confirmed(&mut self, timeout: Duration) -> Result<(), TunnelError> {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(BusEvent::Status(true)) => return Ok(()),
                    Some(BusEvent::Status(false)) => {}
                    Some(BusEvent::Error(e)) => return Err(TunnelError::Session(e)),
                    Some(event @ BusEvent::Message(_)) => self.pending.push_back(event),
                    None => return Err(TunnelError::Session("subscription closed".into())),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TunnelError::Session(format!("subscribe to {} timed out", self.topic)))?
    }

    /// Stop receiving.
    pub fn unsubscribe(self) {}
}

/// Topic-based publish/subscribe transport. No session semantics.
///
/// Delivery is at-most-once and nothing is persisted: frames published while
/// nobody is subscribed are gone.
pub trait RelayBus: Send + Sync {
    /// Publish a frame, best effort.
    fn publish(&self, topic: &str, frame: String);

    /// Subscribe to a topic. The first event of a healthy subscription is
    /// `BusEvent::Status(true)`.
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// Envelope helpers for any [`RelayBus`].
pub trait RelayBusExt {
    /// Encode and publish an envelope.
    fn publish_envelope(&self, topic: &str, envelope: &Envelope);
}

impl<B: RelayBus + ?Sized> RelayBusExt for B {
    fn publish_envelope(&self, topic: &str, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => {
                tracing::debug!(topic, event = envelope.event_name(), "publish");
                self.publish(topic, frame);
            }
            Err(e) => tracing::error!(topic, "Failed to encode {}: {e}", envelope.event_name()),
        }
    }
}
