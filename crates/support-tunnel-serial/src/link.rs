//! Serial link abstraction.

use async_trait::async_trait;
use thiserror::Error;

/// Serial link error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to open {target}: {reason}")]
    Open { target: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device closed the link")]
    Eof,
    #[error("Link is not open")]
    NotOpen,
    #[error("{0} not supported by this link")]
    Unsupported(&'static str),
}

/// An open serial/debug link to the device.
#[async_trait]
pub trait SerialLink: Send {
    /// Read whatever the device has sent, waiting for at least one byte.
    ///
    /// Must be cancel safe: dropping the future loses no data.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Write every byte of `data` to the device.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Drive the DTR and RTS control lines.
    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError>;

    /// Release the underlying handle. Idempotent.
    fn close(&mut self);
}

/// Opens the device link at a given baud rate.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open the link.
    async fn open(&self, baud: u32) -> Result<Box<dyn SerialLink>, LinkError>;

    /// Human-readable name of the device, for logs.
    fn describe(&self) -> String;

    /// Whether [`Self::open`] configures the line at the requested rate.
    fn applies_baud(&self) -> bool {
        true
    }
}
