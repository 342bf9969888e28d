//! Relay bus client for a remote WebSocket hub.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use support_tunnel_core::traits::{BusEvent, RelayBus, Subscription};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientFrame, ServerFrame};

/// First reconnect delay.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Reconnect delay cap.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Keepalive ping period.
const KEEPALIVE: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Publish {
        topic: String,
        frame: String,
    },
    Subscribe {
        id: u64,
        topic: String,
        events: mpsc::UnboundedSender<BusEvent>,
        cancel: CancellationToken,
    },
}

struct Subscriber {
    topic: String,
    events: mpsc::UnboundedSender<BusEvent>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_gone(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }
}

/// Relay bus backed by a WebSocket hub connection.
///
/// The connection is owned by a background task that reconnects with
/// exponential backoff and re-subscribes every live subscription. A lost
/// connection is reported to subscribers as `Status(false)` followed by an
/// `Error`; frames published while disconnected are dropped.
#[derive(Clone)]
pub struct WsRelay {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl WsRelay {
    /// Connect to a hub at `url` (e.g. `ws://127.0.0.1:8080/relay`).
    ///
    /// Returns immediately; the first connection attempt runs in the background.
    #[must_use]
    pub fn connect(url: impl Into<String>) -> Self {
        Self::with_backoff(url, RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }

    /// Connect with a custom reconnect backoff.
    #[must_use]
    pub fn with_backoff(url: impl Into<String>, initial: Duration, max: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let backoff = Backoff {
            initial,
            max,
            current: initial,
        };
        tokio::spawn(run(url.into(), rx, backoff, shutdown.clone()));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl RelayBus for WsRelay {
    fn publish(&self, topic: &str, frame: String) {
        let command = Command::Publish {
            topic: topic.to_string(),
            frame,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!(topic = %topic, "Relay client stopped, frame dropped");
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (events, cancel, subscription) = Subscription::channel(topic);
        let command = Command::Subscribe {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            events: events.clone(),
            cancel,
        };
        if self.commands.send(command).is_err() {
            let _ = events.send(BusEvent::Error("relay client stopped".into()));
        }
        subscription
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

enum Disconnect {
    Lost,
    Shutdown,
}

async fn run(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();

    loop {
        let attempt = tokio::select! {
            () = shutdown.cancelled() => return,
            attempt = connect_async(url.as_str()) => attempt,
        };

        match attempt {
            Ok((socket, _)) => {
                tracing::info!(url = %url, "Relay connected");
                backoff.reset();
                match drive(socket, &mut commands, &mut subscribers, &shutdown).await {
                    Disconnect::Shutdown => return,
                    Disconnect::Lost => {
                        tracing::warn!(url = %url, "Relay connection lost");
                        notify_all(&mut subscribers, &[
                            BusEvent::Status(false),
                            BusEvent::Error("relay connection lost".into()),
                        ]);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, "Relay connect failed: {e}");
                notify_all(&mut subscribers, &[BusEvent::Error(format!(
                    "relay connect failed: {e}"
                ))]);
            }
        }

        let delay = backoff.next_delay();
        tracing::info!("Reconnecting in {delay:?}");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                () = shutdown.cancelled() => return,
                command = commands.recv() => match command {
                    None => return,
                    Some(Command::Publish { topic, .. }) => {
                        tracing::warn!(topic = %topic, "Relay disconnected, frame dropped");
                    }
                    Some(Command::Subscribe { id, topic, events, cancel }) => {
                        subscribers.insert(id, Subscriber { topic, events, cancel });
                    }
                },
            }
        }
    }
}

async fn drive(
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    subscribers: &mut HashMap<u64, Subscriber>,
    shutdown: &CancellationToken,
) -> Disconnect {
    let (mut sink, mut source) = socket.split();

    subscribers.retain(|_, s| !s.is_gone());
    let topics: HashSet<String> = subscribers.values().map(|s| s.topic.clone()).collect();
    for topic in topics {
        if send(&mut sink, &ClientFrame::Subscribe { topic }).await.is_err() {
            return Disconnect::Lost;
        }
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.close().await;
                return Disconnect::Shutdown;
            }
            command = commands.recv() => match command {
                None => {
                    let _ = sink.close().await;
                    return Disconnect::Shutdown;
                }
                Some(Command::Publish { topic, frame }) => {
                    if send(&mut sink, &ClientFrame::Publish { topic, frame }).await.is_err() {
                        return Disconnect::Lost;
                    }
                }
                Some(Command::Subscribe { id, topic, events, cancel }) => {
                    let already = subscribers.values().any(|s| s.topic == topic && !s.is_gone());
                    if already {
                        let _ = events.send(BusEvent::Status(true));
                    }
                    subscribers.insert(id, Subscriber { topic: topic.clone(), events, cancel });
                    if !already && send(&mut sink, &ClientFrame::Subscribe { topic }).await.is_err() {
                        return Disconnect::Lost;
                    }
                }
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Text(text))) => dispatch(&text, subscribers),
                Some(Ok(WsMessage::Close(_))) | None => return Disconnect::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Relay socket error: {e}");
                    return Disconnect::Lost;
                }
            },
            _ = keepalive.tick() => {
                if send(&mut sink, &ClientFrame::Ping).await.is_err() {
                    return Disconnect::Lost;
                }
            }
        }

        for topic in prune(subscribers) {
            if send(&mut sink, &ClientFrame::Unsubscribe { topic }).await.is_err() {
                return Disconnect::Lost;
            }
        }
    }
}

async fn send<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame).map_err(|e| {
        tracing::error!("Failed to serialize frame: {e}");
    })?;
    sink.send(WsMessage::Text(json)).await.map_err(|e| {
        tracing::warn!("Relay send failed: {e}");
    })
}

fn dispatch(text: &str, subscribers: &HashMap<u64, Subscriber>) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("Invalid hub frame: {e}");
            return;
        }
    };

    match frame {
        ServerFrame::Subscribed { topic } => {
            tracing::debug!(topic = %topic, "Subscription live");
            deliver(subscribers, &topic, &BusEvent::Status(true));
        }
        ServerFrame::Message { topic, frame } => {
            deliver(subscribers, &topic, &BusEvent::Message(frame));
        }
        ServerFrame::Error { message } => tracing::warn!("Hub error: {message}"),
        ServerFrame::Pong => {}
    }
}

fn deliver(subscribers: &HashMap<u64, Subscriber>, topic: &str, event: &BusEvent) {
    for subscriber in subscribers.values().filter(|s| s.topic == topic) {
        let _ = subscriber.events.send(event.clone());
    }
}

fn notify_all(subscribers: &mut HashMap<u64, Subscriber>, events: &[BusEvent]) {
    subscribers.retain(|_, s| !s.is_gone());
    for subscriber in subscribers.values() {
        for event in events {
            let _ = subscriber.events.send(event.clone());
        }
    }
}

/// Drop dead subscribers, returning topics nobody listens to anymore.
fn prune(subscribers: &mut HashMap<u64, Subscriber>) -> Vec<String> {
    let gone: Vec<String> = subscribers
        .values()
        .filter(|s| s.is_gone())
        .map(|s| s.topic.clone())
        .collect();
    if gone.is_empty() {
        return gone;
    }
    subscribers.retain(|_, s| !s.is_gone());

    let mut orphaned: Vec<String> = gone
        .into_iter()
        .filter(|topic| !subscribers.values().any(|s| &s.topic == topic))
        .collect();
    orphaned.sort();
    orphaned.dedup();
    orphaned
}
