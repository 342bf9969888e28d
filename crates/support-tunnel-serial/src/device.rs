//! Character-device link.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::link::{LinkError, LinkOpener, SerialLink};

/// Opens a character device (a pty, a named pipe, an already configured tty)
/// as the link.
///
/// Limited fallback for paths the serial driver cannot open. Line settings
/// are configured outside the process: the requested rate is not applied,
/// so baud changes are refused, and control lines are not available.
/// Use [`crate::SerialPortDevice`] for real adapters.
#[derive(Debug, Clone)]
pub struct DeviceFile {
    path: PathBuf,
}

impl DeviceFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LinkOpener for DeviceFile {
    async fn open(&self, baud: u32) -> Result<Box<dyn SerialLink>, LinkError> {
        let open_err = |e: std::io::Error| LinkError::Open {
            target: self.describe(),
            reason: e.to_string(),
        };
        let reader = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(open_err)?;
        // Separate handle so a pending read never blocks a write.
        let writer = reader.try_clone().await.map_err(open_err)?;
        tracing::debug!(path = %self.path.display(), baud, "Opened device file");
        Ok(Box::new(DeviceFileLink {
            reader: Some(reader),
            writer: Some(writer),
        }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn applies_baud(&self) -> bool {
        false
    }
}

struct DeviceFileLink {
    reader: Option<File>,
    writer: Option<File>,
}

#[async_trait]
impl SerialLink for DeviceFileLink {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let reader = self.reader.as_mut().ok_or(LinkError::NotOpen)?;
        Ok(reader.read(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let writer = self.writer.as_mut().ok_or(LinkError::NotOpen)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    fn set_signals(&mut self, _dtr: bool, _rts: bool) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("control lines"))
    }

    fn close(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_fails_to_open() {
        let opener = DeviceFile::new("/nonexistent/ttyUSB9");
        let err = opener.open(115_200).await.err().unwrap();
        assert!(matches!(err, LinkError::Open { .. }));
        assert!(err.to_string().contains("ttyUSB9"));
    }

    #[tokio::test]
    async fn test_file_backed_link() {
        let path = std::env::temp_dir().join(format!("support-tunnel-dev-{}", std::process::id()));
        tokio::fs::write(&path, b"hello").await.unwrap();

        let opener = DeviceFile::new(&path);
        assert!(!opener.applies_baud());
        let mut link = opener.open(115_200).await.unwrap();
        let mut buf = [0u8; 16];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(matches!(
            link.set_signals(true, false),
            Err(LinkError::Unsupported(_))
        ));

        link.close();
        assert!(matches!(link.read(&mut buf).await, Err(LinkError::NotOpen)));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
