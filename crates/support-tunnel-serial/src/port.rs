//! Serial ports opened through the OS serial driver.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::link::{LinkError, LinkOpener, SerialLink};

/// A USB-UART adapter or native UART (`/dev/ttyUSB0`, `COM3`).
///
/// Every open configures the line at the requested baud rate, and DTR/RTS
/// are driven through the driver, so reset and bootloader sequences work.
#[derive(Debug, Clone)]
pub struct SerialPortDevice {
    path: String,
}

impl SerialPortDevice {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LinkOpener for SerialPortDevice {
    async fn open(&self, baud: u32) -> Result<Box<dyn SerialLink>, LinkError> {
        let stream = tokio_serial::new(self.path.as_str(), baud)
            .open_native_async()
            .map_err(|e| LinkError::Open {
                target: self.path.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(path = %self.path, baud, "Opened serial port");
        Ok(Box::new(PortLink::new(stream)))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

struct PortLink {
    stream: Option<SerialStream>,
}

impl PortLink {
    const fn new(stream: SerialStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut SerialStream, LinkError> {
        self.stream.as_mut().ok_or(LinkError::NotOpen)
    }
}

#[async_trait]
impl SerialLink for PortLink {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let stream = self.stream()?;
        Ok(AsyncReadExt::read(stream, buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let stream = self.stream()?;
        AsyncWriteExt::write_all(stream, data).await?;
        AsyncWriteExt::flush(stream).await?;
        Ok(())
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
        let stream = self.stream()?;
        SerialPort::write_data_terminal_ready(stream, dtr).map_err(std::io::Error::from)?;
        SerialPort::write_request_to_send(stream, rts).map_err(std::io::Error::from)?;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
