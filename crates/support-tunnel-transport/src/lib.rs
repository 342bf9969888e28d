//! Relay bus implementations.
//!
//! Provides:
//! - `LocalRelay` - In-process topic broadcast
//! - Hub wire protocol (JSON frames)
//! - WebSocket relay hub (feature: hub)
//! - WebSocket client relay with reconnect (feature: client)

pub mod local;
pub mod protocol;

#[cfg(feature = "hub")]
pub mod hub;

#[cfg(feature = "client")]
pub mod client;

pub use local::LocalRelay;
pub use protocol::{ClientFrame, ServerFrame};

#[cfg(feature = "client")]
pub use client::WsRelay;
