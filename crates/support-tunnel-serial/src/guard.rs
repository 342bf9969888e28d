//! Scoped ownership of the device link.

use std::{collections::VecDeque, sync::Arc};

use crate::link::{LinkError, LinkOpener, SerialLink};

/// Writes buffered while the link is closed before the oldest are dropped.
const MAX_PENDING_WRITES: usize = 1024;

/// Exclusive owner of the device link.
///
/// The link is released when the guard is dropped, whichever way the owning
/// task exits. While the link is closed (between a failed reopen and the next
/// successful one) writes are queued and flushed in order once it reopens.
pub struct LinkGuard {
    opener: Arc<dyn LinkOpener>,
    link: Option<Box<dyn SerialLink>>,
    baud: u32,
    pending: VecDeque<Vec<u8>>,
}

impl LinkGuard {
    /// Open the link at `baud`.
    ///
    /// # Errors
    /// Returns error if the device cannot be opened.
    pub async fn acquire(opener: Arc<dyn LinkOpener>, baud: u32) -> Result<Self, LinkError> {
        let link = opener.open(baud).await?;
        tracing::info!(device = %opener.describe(), baud, "Device link acquired");
        Ok(Self {
            opener,
            link: Some(link),
            baud,
            pending: VecDeque::new(),
        })
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Baud rate the link was last (re)opened with.
    #[must_use]
    pub const fn baud(&self) -> u32 {
        self.baud
    }

    /// Whether [`Self::reopen`] can change the line rate of this device.
    #[must_use]
    pub fn applies_baud(&self) -> bool {
        self.opener.applies_baud()
    }

    /// Human-readable device name.
    #[must_use]
    pub fn describe(&self) -> String {
        self.opener.describe()
    }

    /// Writes waiting for the link to reopen.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Read from the device. Never resolves while the link is closed.
    ///
    /// A read failure releases the link.
    ///
    /// # Errors
    /// Returns error if the device read fails or reaches end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };
        match link.read(buf).await {
            Ok(0) => {
                self.release();
                Err(LinkError::Eof)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Write to the device, or queue the bytes if the link is closed.
    ///
    /// A write failure releases the link.
    ///
    /// # Errors
    /// Returns error if the device write fails.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let Some(link) = self.link.as_mut() else {
            if self.pending.len() >= MAX_PENDING_WRITES {
                self.pending.pop_front();
                tracing::warn!("Pending write queue full, oldest write dropped");
            }
            self.pending.push_back(data.to_vec());
            return Ok(());
        };
        if let Err(e) = link.write_all(data).await {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Drive the control lines.
    ///
    /// # Errors
    /// Returns error if the link is closed or rejects the change.
    pub fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
        self.link
            .as_mut()
            .ok_or(LinkError::NotOpen)?
            .set_signals(dtr, rts)
    }

    /// Close the link and open it again at `baud`, then flush queued writes.
    ///
    /// On failure the link stays closed and later writes keep queueing.
    ///
    /// # Errors
    /// Returns error if the reopen or the flush fails.
    pub async fn reopen(&mut self, baud: u32) -> Result<(), LinkError> {
        self.release();
        self.baud = baud;
        let link = self.opener.open(baud).await?;
        tracing::info!(device = %self.opener.describe(), baud, "Device link reopened");
        self.link = Some(link);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), LinkError> {
        while let Some(data) = self.pending.pop_front() {
            let Some(link) = self.link.as_mut() else {
                self.pending.push_front(data);
                return Err(LinkError::NotOpen);
            };
            if let Err(e) = link.write_all(&data).await {
                self.pending.push_front(data);
                self.release();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the link now. Later writes queue until [`Self::reopen`].
    pub fn release(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            tracing::info!(device = %self.opener.describe(), "Device link released");
        }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}
