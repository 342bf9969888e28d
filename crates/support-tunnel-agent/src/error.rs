use support_tunnel_core::{TunnelError, protocol::ActionKind};
use support_tunnel_serial::LinkError;
use support_tunnel_session::ManagerError;
use thiserror::Error;

/// Requester endpoint error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Device link unavailable: {0}")]
    Link(#[from] LinkError),
    #[error(transparent)]
    Session(#[from] ManagerError),
    #[error("Agent is no longer running")]
    Stopped,
}

/// Operator endpoint error.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Session(#[from] ManagerError),
    #[error("Subscribe failed: {0}")]
    Subscribe(TunnelError),
    #[error("Flash requires a manifest URL")]
    MissingManifest,
    #[error("{0} is already awaiting a result")]
    ActionPending(ActionKind),
    #[error("Session has ended")]
    Ended,
}

impl From<AgentError> for TunnelError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Link(e) => Self::Connection(e.to_string()),
            AgentError::Session(e) => e.into(),
            AgentError::Stopped => Self::Session("agent is no longer running".into()),
        }
    }
}

impl From<AdminError> for TunnelError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Session(e) => e.into(),
            AdminError::Subscribe(e) => e,
            other => Self::Session(other.to_string()),
        }
    }
}
