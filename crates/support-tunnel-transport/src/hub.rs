//! WebSocket relay hub.

use std::collections::HashMap;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use support_tunnel_core::traits::{BusEvent, RelayBus};
use tokio::{sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::{
    local::LocalRelay,
    protocol::{ClientFrame, ServerFrame},
};

/// Hub state: the relay shared by every connection.
#[derive(Clone)]
pub struct HubState {
    relay: LocalRelay,
}

impl HubState {
    /// Create new hub state.
    #[must_use]
    pub const fn new(relay: LocalRelay) -> Self {
        Self { relay }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    let (mut sender, mut receiver) = socket.split();
    let peer = state.relay.endpoint();

    // Channel for sending frames to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Spawn task to forward frames to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwards: HashMap<String, JoinHandle<()>> = HashMap::new();

    // Handle incoming frames
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("WebSocket error: {e}");
                break;
            }
        };

        let frame: ClientFrame = match serde_json::from_str(&msg) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Invalid client frame: {e}");
                let _ = tx.send(ServerFrame::Error {
                    message: format!("Invalid frame: {e}"),
                });
                continue;
            }
        };

        match frame {
            ClientFrame::Ping => {
                let _ = tx.send(ServerFrame::Pong);
            }
            ClientFrame::Subscribe { topic } => {
                if forwards.contains_key(&topic) {
                    let _ = tx.send(ServerFrame::Subscribed { topic });
                    continue;
                }
                tracing::debug!(topic = %topic, "Client subscribed");
                let handle = spawn_forwarder(&peer, topic.clone(), tx.clone());
                forwards.insert(topic, handle);
            }
            ClientFrame::Unsubscribe { topic } => {
                if let Some(handle) = forwards.remove(&topic) {
                    tracing::debug!(topic = %topic, "Client unsubscribed");
                    handle.abort();
                }
            }
            ClientFrame::Publish { topic, frame } => peer.publish(&topic, frame),
        }
    }

    for handle in forwards.into_values() {
        handle.abort();
    }
    send_task.abort();
}

fn spawn_forwarder(
    peer: &LocalRelay,
    topic: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
) -> JoinHandle<()> {
    let mut subscription = peer.subscribe(&topic);
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let frame = match event {
                BusEvent::Message(frame) => ServerFrame::Message {
                    topic: topic.clone(),
                    frame,
                },
                BusEvent::Status(true) => ServerFrame::Subscribed {
                    topic: topic.clone(),
                },
                BusEvent::Status(false) => continue,
                BusEvent::Error(message) => ServerFrame::Error { message },
            };
            if tx.send(frame).is_err() {
                break;
            }
        }
    })
}

/// Create the hub router, serving the relay at `/relay`.
///
/// # Example
/// ```ignore
/// let app = create_hub_router(LocalRelay::new());
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_hub_router(relay: LocalRelay) -> axum::Router {
    axum::Router::new()
        .route("/relay", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(HubState::new(relay))
}
