use support_tunnel_core::TunnelError;
use support_tunnel_serial::LinkError;
use thiserror::Error;

/// Flash run error.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Manifest unavailable: {0}")]
    Manifest(String),
    #[error("No build in manifest {manifest} for chip {chip}")]
    NoBuild { manifest: String, chip: String },
    #[error("Firmware part {path} unavailable: {reason}")]
    Part { path: String, reason: String },
    #[error("Device error: {0}")]
    Device(String),
    #[error("Device link: {0}")]
    Link(#[from] LinkError),
    #[error("Verification failed at 0x{offset:x}")]
    Verify { offset: u32 },
    #[error("Flash aborted")]
    Aborted,
}

impl From<FlashError> for TunnelError {
    fn from(err: FlashError) -> Self {
        Self::Flash(err.to_string())
    }
}
