//! In-memory device for tests and demos.
//!
//! Bytes written to the link echo back as device output, like a terminal
//! with local echo. Control-line changes can emit boot banners so reset and
//! bootloader sequences have visible effects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::link::{LinkError, LinkOpener, SerialLink};

/// Printed after a reset into the application.
pub const BOOT_BANNER: &str = "rst:0x1 (POWERON_RESET),boot:0x13 (SPI_FAST_FLASH_BOOT)\r\n";
/// Printed after a reset into the ROM download mode.
pub const DOWNLOAD_BANNER: &str = "rst:0x1 (POWERON_RESET),boot:0x3 (DOWNLOAD_BOOT)\r\nwaiting for download\r\n";

#[derive(Default)]
struct State {
    open: bool,
    opens: usize,
    closes: usize,
    fail_next_open: bool,
    echo: bool,
    banners: bool,
    bauds: Vec<u32>,
    signals: Vec<(bool, bool)>,
    last_signals: (bool, bool),
    written: Vec<u8>,
    leftover: Vec<u8>,
}

/// Scriptable in-memory device.
#[derive(Clone)]
pub struct LoopbackDevice {
    state: Arc<Mutex<State>>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    output_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDevice {
    /// Echoing device without boot banners.
    #[must_use]
    pub fn new() -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State {
                echo: true,
                ..State::default()
            })),
            output_tx,
            output_rx: Arc::new(AsyncMutex::new(output_rx)),
        }
    }

    /// Emit boot banners when RTS is released.
    #[must_use]
    pub fn with_banners(self) -> Self {
        self.lock().banners = true;
        self
    }

    /// Disable local echo.
    #[must_use]
    pub fn without_echo(self) -> Self {
        self.lock().echo = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue output as if the device printed it.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            let _ = self.output_tx.send(bytes);
        }
    }

    /// Make the next read on the open link report end of stream.
    pub fn disconnect(&self) {
        let _ = self.output_tx.send(Vec::new());
    }

    /// Make the next open fail.
    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Baud rates of every successful open, in order.
    #[must_use]
    pub fn bauds(&self) -> Vec<u32> {
        self.lock().bauds.clone()
    }

    /// Every (dtr, rts) pair applied, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<(bool, bool)> {
        self.lock().signals.clone()
    }

    /// Every byte written to the device.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }
}

#[async_trait]
impl LinkOpener for LoopbackDevice {
    async fn open(&self, baud: u32) -> Result<Box<dyn SerialLink>, LinkError> {
        let mut state = self.lock();
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(LinkError::Open {
                target: self.describe(),
                reason: "device busy".into(),
            });
        }
        if state.open {
            return Err(LinkError::Open {
                target: self.describe(),
                reason: "already open".into(),
            });
        }
        state.open = true;
        state.opens += 1;
        state.bauds.push(baud);
        state.last_signals = (false, false);
        drop(state);
        Ok(Box::new(LoopbackLink {
            device: self.clone(),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "loopback".into()
    }
}

struct LoopbackLink {
    device: LoopbackDevice,
    closed: bool,
}

#[async_trait]
impl SerialLink for LoopbackLink {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.closed {
            return Err(LinkError::NotOpen);
        }
        {
            let mut state = self.device.lock();
            if !state.leftover.is_empty() {
                let n = buf.len().min(state.leftover.len());
                buf[..n].copy_from_slice(&state.leftover[..n]);
                state.leftover.drain(..n);
                return Ok(n);
            }
        }

        let mut rx = self.device.output_rx.lock().await;
        let Some(chunk) = rx.recv().await else {
            return Ok(0);
        };
        if chunk.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.device.lock().leftover.extend_from_slice(&chunk[n..]);
        }
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::NotOpen);
        }
        let echo = {
            let mut state = self.device.lock();
            state.written.extend_from_slice(data);
            state.echo
        };
        if echo {
            self.device.inject(data.to_vec());
        }
        Ok(())
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::NotOpen);
        }
        let banner = {
            let mut state = self.device.lock();
            state.signals.push((dtr, rts));
            let (_, was_rts) = state.last_signals;
            state.last_signals = (dtr, rts);
            match (state.banners, was_rts && !rts) {
                (true, true) if dtr => Some(DOWNLOAD_BANNER),
                (true, true) => Some(BOOT_BANNER),
                _ => None,
            }
        };
        if let Some(banner) = banner {
            self.device.inject(banner.as_bytes().to_vec());
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.device.lock();
            state.open = false;
            state.closes += 1;
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.close();
    }
}
