//! Wire protocol between relay clients and the relay hub.

use serde::{Deserialize, Serialize};

/// Frame from client to hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving frames published on a topic.
    Subscribe { topic: String },
    /// Stop receiving frames for a topic.
    Unsubscribe { topic: String },
    /// Publish a frame to every other subscriber of a topic.
    Publish { topic: String, frame: String },
    /// Ping for keepalive.
    Ping,
}

/// Frame from hub to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Subscription is live.
    Subscribed { topic: String },
    /// A frame published on a subscribed topic.
    Message { topic: String, frame: String },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}
