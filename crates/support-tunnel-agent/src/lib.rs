//! Requester and operator endpoints of the support tunnel.
//!
//! - `UserAgent` - Owns the device link and bridges it onto a session topic
//! - `AdminAgent` - Joins a session and drives the device remotely
//! - `HealthMonitor` - Heartbeat-based bridge health
//! - `PortBridge` - RFC 2217 server exposing the remote device to local tools

pub mod admin;
pub mod error;
pub mod health;
pub mod port_bridge;
pub(crate) mod relay;
pub mod user_agent;

#[cfg(test)]
mod scenario;

pub use admin::{AdminAgent, PORT_BRIDGE_KIND};
pub use error::{AdminError, AgentError};
pub use health::{BridgeHealth, HealthChange, HealthMonitor};
pub use port_bridge::{PortBridge, PortRequest};
pub use relay::{MAX_RESUBSCRIBE_DELAY, RESUBSCRIBE_DELAY};
pub use user_agent::{UserAgent, UserAgentHandle};
