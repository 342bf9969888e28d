//! Chip programming abstraction.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use support_tunnel_core::protocol::FlashPhase;
use support_tunnel_serial::LinkGuard;

use crate::error::FlashError;

/// Programs the device's flash memory.
///
/// A run lends the flasher the device link for its whole duration; every
/// call receives it.
#[async_trait]
pub trait Flasher: Send + Sync {
    /// Connect to the ROM loader and return the detected chip family.
    async fn connect(&self, link: &mut LinkGuard) -> Result<String, FlashError>;

    /// Erase `len` bytes at `offset` ahead of writing an image there.
    async fn erase(&self, link: &mut LinkGuard, offset: u32, len: usize) -> Result<(), FlashError>;

    async fn write(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Check that `data` is present at `offset`.
    async fn verify(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Hard-reset into the new firmware.
    async fn reset(&self, link: &mut LinkGuard) -> Result<(), FlashError>;

    /// Writes must be a multiple of this many bytes, except the last one of
    /// an image.
    fn write_alignment(&self) -> usize {
        1
    }
}

const ERASED: u8 = 0xFF;

#[derive(Debug, Default)]
struct FlashState {
    memory: Vec<u8>,
    writes: usize,
    resets: usize,
    fail_in: Option<FlashPhase>,
    corrupt_verify: bool,
}

/// Flash memory simulated in a byte vector. Never touches the link.
#[derive(Debug, Clone)]
pub struct MemoryFlasher {
    chip: String,
    write_delay: Duration,
    state: Arc<Mutex<FlashState>>,
}

impl MemoryFlasher {
    #[must_use]
    pub fn new(chip: impl Into<String>) -> Self {
        Self {
            chip: chip.into(),
            write_delay: Duration::ZERO,
            state: Arc::default(),
        }
    }

    /// Sleep this long in every write.
    #[must_use]
    pub const fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail the first operation belonging to `phase`.
    pub fn fail_in(&self, phase: FlashPhase) {
        self.lock().fail_in = Some(phase);
    }

    /// Report a mismatch on the next verify.
    pub fn corrupt_verify(&self) {
        self.lock().corrupt_verify = true;
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    #[must_use]
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Copy of `len` bytes at `offset`, erased bytes included.
    #[must_use]
    pub fn read(&self, offset: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        let start = offset as usize;
        (start..start + len)
            .map(|i| state.memory.get(i).copied().unwrap_or(ERASED))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, phase: FlashPhase) -> Result<(), FlashError> {
        let mut state = self.lock();
        if state.fail_in == Some(phase) {
            state.fail_in = None;
            return Err(FlashError::Device(format!("simulated fault while {phase}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Flasher for MemoryFlasher {
    async fn connect(&self, _link: &mut LinkGuard) -> Result<String, FlashError> {
        self.check(FlashPhase::Connecting)?;
        Ok(self.chip.clone())
    }

    async fn erase(&self, _link: &mut LinkGuard, offset: u32, len: usize) -> Result<(), FlashError> {
        self.check(FlashPhase::Erasing)?;
        let mut state = self.lock();
        let start = (offset as usize).min(state.memory.len());
        let end = (offset as usize + len).min(state.memory.len());
        state.memory[start..end].fill(ERASED);
        Ok(())
    }

    async fn write(&self, _link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.check(FlashPhase::Flashing)?;
        let mut state = self.lock();
        let start = offset as usize;
        let end = start + data.len();
        if state.memory.len() < end {
            state.memory.resize(end, ERASED);
        }
        state.memory[start..end].copy_from_slice(data);
        state.writes += 1;
        Ok(())
    }

    async fn verify(&self, _link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check(FlashPhase::Verifying)?;
        let corrupt = std::mem::take(&mut self.lock().corrupt_verify);
        if corrupt || self.read(offset, data.len()) != data {
            return Err(FlashError::Verify { offset });
        }
        Ok(())
    }

    async fn reset(&self, _link: &mut LinkGuard) -> Result<(), FlashError> {
        self.check(FlashPhase::Resetting)?;
        self.lock().resets += 1;
        Ok(())
    }
}
