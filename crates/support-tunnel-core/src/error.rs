//! Error taxonomy shared by both endpoints.

use thiserror::Error;

use crate::{
    session::SessionId,
    terminal::{LineLevel, TerminalLine},
};

/// Failure to interpret an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
}

/// Faults surfaced to an operator or requester console.
///
/// Every variant maps to exactly one rendering in the terminal view; none of
/// them closes the session on its own.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// Serial open/write failure on the requester side.
    #[error("Device link error: {0}")]
    Connection(String),
    /// Malformed envelope or unknown event.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Phase-specific flash failure.
    #[error("Flash failed: {0}")]
    Flash(String),
    /// Relay subscribe failure or timeout.
    #[error("Relay error: {0}")]
    Session(String),
    /// Join attempted on an active or closed session.
    #[error("Session unavailable: {0}")]
    Authorization(SessionId),
}

impl TunnelError {
    /// Severity used when this error is rendered as a terminal line.
    #[must_use]
    pub const fn level(&self) -> LineLevel {
        match self {
            Self::Protocol(_) => LineLevel::Warn,
            Self::Connection(_) | Self::Flash(_) | Self::Session(_) | Self::Authorization(_) => {
                LineLevel::Error
            }
        }
    }

    /// Render as a `system` terminal line.
    #[must_use]
    pub fn to_line(&self) -> TerminalLine {
        TerminalLine::system(self.level(), self.to_string())
    }
}
