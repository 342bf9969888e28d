//! Core abstractions for the remote device support tunnel.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - The tagged `{event, payload}` wire unit
//! - `Session` - Session record with its lifecycle state machine
//! - `TerminalAggregator` - Bounded, ordered terminal view
//! - `SessionStore` and `RelayBus` traits

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod terminal;
pub mod traits;

pub use config::TunnelConfig;
pub use error::{ProtocolError, TunnelError};
pub use protocol::Envelope;
pub use session::{Session, SessionId, SessionStatus};
pub use terminal::{TerminalAggregator, TerminalLine};
pub use traits::{BusEvent, RelayBus, RelayBusExt, SessionStore, Subscription};
