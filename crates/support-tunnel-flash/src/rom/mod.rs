//! ESP serial ROM loader.
//!
//! Talks the loader protocol that every ESP chip's mask ROM speaks in
//! download mode: SLIP-framed request/response packets over the same UART
//! that carries the console. No stub is uploaded; flashing runs against the
//! ROM's own `FLASH_BEGIN`/`FLASH_DATA` commands and is verified with its
//! `SPI_FLASH_MD5`.

pub mod slip;

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use md5::{Digest, Md5};
use support_tunnel_serial::{BOOTLOADER_SEQUENCE, LinkGuard, RESET_SEQUENCE, run_sequence};
use tokio::time::Instant;

use self::slip::{Response, SlipDecoder};
use crate::{error::FlashError, flasher::Flasher};

const FLASH_BEGIN: u8 = 0x02;
const FLASH_DATA: u8 = 0x03;
const FLASH_END: u8 = 0x04;
const SYNC: u8 = 0x08;
const READ_REG: u8 = 0x0A;
const SPI_SET_PARAMS: u8 = 0x0B;
const SPI_ATTACH: u8 = 0x0D;
const SPI_FLASH_MD5: u8 = 0x13;

/// Register holding a per-family magic value.
const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

/// Largest `FLASH_DATA` payload the ROM accepts.
pub const FLASH_BLOCK_BYTES: usize = 0x400;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const SYNC_ATTEMPTS: usize = 10;
const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const DEFAULT_FLASH_SIZE: u32 = 4 * 1024 * 1024;

fn scaled_timeout(per_mb: Duration, len: usize) -> Duration {
    let megabytes = u32::try_from(len.div_ceil(1024 * 1024)).unwrap_or(u32::MAX);
    per_mb.saturating_mul(megabytes).max(COMMAND_TIMEOUT)
}

fn word(value: usize) -> Result<u32, FlashError> {
    u32::try_from(value).map_err(|_| FlashError::Device(format!("{value} does not fit a loader word")))
}

/// Chip families the loader can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    Esp8266,
    Esp32,
    Esp32S2,
    Esp32S3,
    Esp32C3,
}

impl Chip {
    #[must_use]
    pub const fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            0xFFF0_C101 => Some(Self::Esp8266),
            0x00F0_1D83 => Some(Self::Esp32),
            0x0000_07C6 => Some(Self::Esp32S2),
            0x0000_0009 => Some(Self::Esp32S3),
            0x6921_506F | 0x1B31_506F | 0x4881_606F | 0x4361_606F => Some(Self::Esp32C3),
            _ => None,
        }
    }

    /// Family name as it appears in firmware manifests.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Esp8266 => "ESP8266",
            Self::Esp32 => "ESP32",
            Self::Esp32S2 => "ESP32-S2",
            Self::Esp32S3 => "ESP32-S3",
            Self::Esp32C3 => "ESP32-C3",
        }
    }

    const fn status_bytes(self) -> usize {
        match self {
            Self::Esp8266 => 2,
            _ => 4,
        }
    }

    /// Later ROMs take an extra "encrypted" word in `FLASH_BEGIN`.
    const fn begin_takes_encryption_flag(self) -> bool {
        matches!(self, Self::Esp32S2 | Self::Esp32S3 | Self::Esp32C3)
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: u32,
    len: usize,
}

impl Region {
    fn blocks(self) -> usize {
        self.len.div_ceil(FLASH_BLOCK_BYTES)
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next: u32,
    seq: u32,
}

#[derive(Default)]
struct RomState {
    chip: Option<Chip>,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
    regions: Vec<Region>,
    cursor: Option<Cursor>,
}

/// Flashes through the chip's ROM loader over the device link.
pub struct RomFlasher {
    flash_size: u32,
    state: Mutex<RomState>,
}

impl Default for RomFlasher {
    fn default() -> Self {
        Self::new()
    }
}

impl RomFlasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flash_size: DEFAULT_FLASH_SIZE,
            state: Mutex::default(),
        }
    }

    /// Flash chip size reported to the ROM. Defaults to 4 MiB.
    #[must_use]
    pub const fn with_flash_size(mut self, bytes: u32) -> Self {
        self.flash_size = bytes;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_bytes(&self) -> usize {
        self.lock().chip.map_or(2, Chip::status_bytes)
    }

    async fn send(
        &self,
        link: &mut LinkGuard,
        op: u8,
        data: &[u8],
        checksum: u32,
    ) -> Result<(), FlashError> {
        let frame = slip::encode(&slip::request(op, data, checksum));
        link.write(&frame).await?;
        Ok(())
    }

    /// Wait for the reply to `op`, skipping stale replies to other commands.
    async fn response(
        &self,
        link: &mut LinkGuard,
        op: u8,
        timeout: Duration,
    ) -> Result<Response, FlashError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        loop {
            loop {
                let Some(frame) = self.lock().frames.pop_front() else {
                    break;
                };
                match Response::parse(&frame) {
                    Some(response) if response.op == op => return self.check_status(response),
                    _ => tracing::trace!(op, "Skipped unrelated loader frame"),
                }
            }
            let n = tokio::time::timeout_at(deadline, link.read(&mut buf))
                .await
                .map_err(|_| FlashError::Device(format!("no reply to loader command 0x{op:02x}")))??;
            let mut state = self.lock();
            let frames = state.decoder.push(&buf[..n]);
            state.frames.extend(frames);
        }
    }

    fn check_status(&self, response: Response) -> Result<Response, FlashError> {
        let status_len = self.status_bytes();
        let Some(status_at) = response.data.len().checked_sub(status_len) else {
            return Err(FlashError::Device(format!(
                "short reply to loader command 0x{:02x}",
                response.op
            )));
        };
        let (status, code) = (response.data[status_at], response.data[status_at + 1]);
        if status != 0 {
            return Err(FlashError::Device(format!(
                "loader command 0x{:02x} failed with ROM error 0x{code:02x}",
                response.op
            )));
        }
        Ok(response)
    }

    async fn command(
        &self,
        link: &mut LinkGuard,
        op: u8,
        data: &[u8],
        checksum: u32,
        timeout: Duration,
    ) -> Result<Response, FlashError> {
        self.send(link, op, data, checksum).await?;
        self.response(link, op, timeout).await
    }

    async fn sync(&self, link: &mut LinkGuard) -> Result<(), FlashError> {
        let mut body = vec![0x07, 0x07, 0x12, 0x20];
        body.extend_from_slice(&[0x55; 32]);
        let mut attempt = 1;
        loop {
            match self.command(link, SYNC, &body, 0, SYNC_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(FlashError::Device(reason)) if attempt < SYNC_ATTEMPTS => {
                    tracing::debug!(attempt, %reason, "Loader did not answer sync");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn begin(
        &self,
        link: &mut LinkGuard,
        region: Region,
        erase_len: usize,
    ) -> Result<(), FlashError> {
        let chip = self.lock().chip;
        let mut fields = vec![
            word(erase_len)?,
            word(region.blocks())?,
            word(FLASH_BLOCK_BYTES)?,
            region.offset,
        ];
        if chip.is_some_and(Chip::begin_takes_encryption_flag) {
            fields.push(0);
        }
        self.command(
            link,
            FLASH_BEGIN,
            &slip::words(&fields),
            0,
            scaled_timeout(ERASE_TIMEOUT_PER_MB, erase_len),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Flasher for RomFlasher {
    async fn connect(&self, link: &mut LinkGuard) -> Result<String, FlashError> {
        *self.lock() = RomState::default();
        run_sequence(link, BOOTLOADER_SEQUENCE).await?;
        self.sync(link).await?;

        let magic = self
            .command(
                link,
                READ_REG,
                &CHIP_DETECT_MAGIC_REG.to_le_bytes(),
                0,
                COMMAND_TIMEOUT,
            )
            .await?
            .value;
        let chip = Chip::from_magic(magic)
            .ok_or_else(|| FlashError::Device(format!("unrecognized chip magic 0x{magic:08x}")))?;
        self.lock().chip = Some(chip);

        if chip != Chip::Esp8266 {
            self.command(link, SPI_ATTACH, &[0; 8], 0, COMMAND_TIMEOUT)
                .await?;
            let params = slip::words(&[0, self.flash_size, 64 * 1024, 4 * 1024, 256, 0xFFFF]);
            self.command(link, SPI_SET_PARAMS, &params, 0, COMMAND_TIMEOUT)
                .await?;
        }
        tracing::info!(chip = chip.name(), "ROM loader connected");
        Ok(chip.name().to_owned())
    }

    async fn erase(&self, link: &mut LinkGuard, offset: u32, len: usize) -> Result<(), FlashError> {
        let region = Region { offset, len };
        self.begin(link, region, len).await?;
        let mut state = self.lock();
        state.regions.push(region);
        state.cursor = None;
        Ok(())
    }

    async fn write(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let (cursor, region) = {
            let state = self.lock();
            let region = state.regions.iter().copied().find(|r| r.offset == offset);
            (state.cursor.filter(|c| c.next == offset), region)
        };
        let mut cursor = match (cursor, region) {
            (Some(cursor), _) => cursor,
            (None, Some(region)) => {
                // Re-enter an erased region without erasing it again.
                self.begin(link, region, 0).await?;
                Cursor {
                    next: offset,
                    seq: 0,
                }
            }
            (None, None) => {
                return Err(FlashError::Device(format!(
                    "write at 0x{offset:x} outside an erased region"
                )));
            }
        };

        for block in data.chunks(FLASH_BLOCK_BYTES) {
            let mut padded = block.to_vec();
            padded.resize(FLASH_BLOCK_BYTES, 0xFF);
            let mut body = slip::words(&[word(padded.len())?, cursor.seq, 0, 0]);
            body.extend_from_slice(&padded);
            self.command(link, FLASH_DATA, &body, slip::checksum(&padded), COMMAND_TIMEOUT)
                .await?;
            cursor.seq += 1;
            cursor.next += word(block.len())?;
            self.lock().cursor = Some(cursor);
        }
        Ok(())
    }

    async fn verify(&self, link: &mut LinkGuard, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let body = slip::words(&[offset, word(data.len())?, 0, 0]);
        let response = self
            .command(
                link,
                SPI_FLASH_MD5,
                &body,
                0,
                scaled_timeout(MD5_TIMEOUT_PER_MB, data.len()),
            )
            .await?;
        let reported = response.data.get(..32).unwrap_or_default();
        let expected = format!("{:x}", Md5::digest(data));
        if !reported.eq_ignore_ascii_case(expected.as_bytes()) {
            tracing::warn!(offset, expected = %expected, reported = %String::from_utf8_lossy(reported), "Flash digest mismatch");
            return Err(FlashError::Verify { offset });
        }
        Ok(())
    }

    async fn reset(&self, link: &mut LinkGuard) -> Result<(), FlashError> {
        // Stay in the loader; the control lines do the reboot.
        self.command(link, FLASH_END, &slip::words(&[1]), 0, COMMAND_TIMEOUT)
            .await?;
        run_sequence(link, RESET_SEQUENCE).await?;
        Ok(())
    }

    fn write_alignment(&self) -> usize {
        FLASH_BLOCK_BYTES
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use support_tunnel_serial::{LinkError, LinkOpener, SerialLink};
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct Sim {
        magic: u32,
        ignore_syncs: usize,
        corrupt_after_write: bool,
        decoder: SlipDecoder,
        flash: HashMap<u32, u8>,
        begin: Option<u32>,
        erased: Vec<(u32, u32)>,
        ops: Vec<u8>,
        signals: Vec<(bool, bool)>,
    }

    impl Sim {
        fn reply(op: u8, value: u32, data: &[u8]) -> Vec<u8> {
            let mut body = data.to_vec();
            body.extend_from_slice(&[0, 0, 0, 0]);
            let mut packet = vec![0x01, op];
            packet.extend_from_slice(&u16::try_from(body.len()).unwrap().to_le_bytes());
            packet.extend_from_slice(&value.to_le_bytes());
            packet.extend_from_slice(&body);
            slip::encode(&packet)
        }

        fn word(data: &[u8], i: usize) -> u32 {
            u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap())
        }

        fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
            let (op, data) = (frame[1], &frame[8..]);
            self.ops.push(op);
            match op {
                SYNC if self.ignore_syncs > 0 => {
                    self.ignore_syncs -= 1;
                    None
                }
                READ_REG => Some(Self::reply(op, self.magic, &[])),
                FLASH_BEGIN => {
                    let (erase, offset) = (Self::word(data, 0), Self::word(data, 3));
                    for addr in offset..offset + erase {
                        self.flash.remove(&addr);
                    }
                    self.erased.push((offset, erase));
                    self.begin = Some(offset);
                    Some(Self::reply(op, 0, &[]))
                }
                FLASH_DATA => {
                    let (size, seq) = (Self::word(data, 0), Self::word(data, 1));
                    let block = &data[16..16 + size as usize];
                    let checksum = u32::from_le_bytes(frame[4..8].try_into().unwrap());
                    assert_eq!(checksum, slip::checksum(block));
                    let base = self.begin.unwrap() + seq * size;
                    for (i, b) in block.iter().enumerate() {
                        self.flash.insert(base + i as u32, *b);
                    }
                    if self.corrupt_after_write {
                        self.flash.insert(base, !block[0]);
                    }
                    Some(Self::reply(op, 0, &[]))
                }
                SPI_FLASH_MD5 => {
                    let (addr, size) = (Self::word(data, 0), Self::word(data, 1));
                    let bytes: Vec<u8> = (addr..addr + size)
                        .map(|a| self.flash.get(&a).copied().unwrap_or(0xFF))
                        .collect();
                    let digest = format!("{:x}", Md5::digest(&bytes));
                    Some(Self::reply(op, 0, digest.as_bytes()))
                }
                _ => Some(Self::reply(op, 0, &[])),
            }
        }
    }

    /// A chip sitting in download mode.
    #[derive(Clone)]
    struct FakeRom(Arc<Mutex<Sim>>);

    impl FakeRom {
        fn new(magic: u32) -> Self {
            Self(Arc::new(Mutex::new(Sim {
                magic,
                ..Sim::default()
            })))
        }

        fn sim(&self) -> std::sync::MutexGuard<'_, Sim> {
            self.0.lock().unwrap()
        }

        fn read(&self, offset: u32, len: u32) -> Vec<u8> {
            let sim = self.sim();
            (offset..offset + len)
                .map(|a| sim.flash.get(&a).copied().unwrap_or(0xFF))
                .collect()
        }
    }

    struct FakeRomLink {
        rom: FakeRom,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        leftover: Vec<u8>,
    }

    #[async_trait]
    impl SerialLink for FakeRomLink {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
            if self.leftover.is_empty() {
                self.leftover = self.rx.recv().await.ok_or(LinkError::Eof)?;
            }
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Ok(n)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
            let mut sim = self.rom.sim();
            for frame in sim.decoder.push(data) {
                if let Some(reply) = sim.handle(&frame) {
                    let _ = self.tx.send(reply);
                }
            }
            Ok(())
        }

        fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<(), LinkError> {
            self.rom.sim().signals.push((dtr, rts));
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[async_trait]
    impl LinkOpener for FakeRom {
        async fn open(&self, _baud: u32) -> Result<Box<dyn SerialLink>, LinkError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(b"rst:0x1 (POWERON_RESET),boot:0x3 (DOWNLOAD_BOOT)\r\n".to_vec());
            Ok(Box::new(FakeRomLink {
                rom: self.clone(),
                tx,
                rx,
                leftover: Vec::new(),
            }))
        }

        fn describe(&self) -> String {
            "fake-rom".into()
        }
    }

    async fn link(rom: &FakeRom) -> LinkGuard {
        LinkGuard::acquire(Arc::new(rom.clone()), 115_200)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_program_and_verify_through_the_loader() {
        let rom = FakeRom::new(0x00F0_1D83);
        let mut link = link(&rom).await;
        let flasher = RomFlasher::new();

        assert_eq!(flasher.connect(&mut link).await.unwrap(), "ESP32");
        let image: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        flasher.erase(&mut link, 0x1_0000, image.len()).await.unwrap();
        flasher.write(&mut link, 0x1_0000, &image[..2048]).await.unwrap();
        flasher.write(&mut link, 0x1_0800, &image[2048..]).await.unwrap();
        flasher.verify(&mut link, 0x1_0000, &image).await.unwrap();
        flasher.reset(&mut link).await.unwrap();

        assert_eq!(rom.read(0x1_0000, 2500), image);
        // the padded tail of the last block is erased flash
        assert_eq!(rom.read(0x1_0000 + 2500, 4), [0xFF; 4]);

        let sim = rom.sim();
        assert_eq!(sim.erased, [(0x1_0000, 2500), (0x1_0000, 0)]);
        assert_eq!(
            sim.ops.iter().filter(|&&op| op == FLASH_DATA).count(),
            3
        );
        assert_eq!(
            sim.signals,
            [
                (false, true),
                (true, false),
                (false, false),
                (false, true),
                (false, false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_retries_until_loader_answers() {
        let rom = FakeRom::new(0x0000_0009);
        rom.sim().ignore_syncs = 3;
        let mut link = link(&rom).await;

        let chip = RomFlasher::new().connect(&mut link).await.unwrap();
        assert_eq!(chip, "ESP32-S3");
        assert_eq!(rom.sim().ops.iter().filter(|&&op| op == SYNC).count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_loader_fails_to_connect() {
        let rom = FakeRom::new(0x00F0_1D83);
        rom.sim().ignore_syncs = usize::MAX;
        let mut link = link(&rom).await;

        let err = RomFlasher::new().connect(&mut link).await.unwrap_err();
        assert!(err.to_string().contains("no reply"), "{err}");
        assert_eq!(rom.sim().ops.len(), SYNC_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_magic_is_rejected() {
        let rom = FakeRom::new(0xDEAD_BEEF);
        let mut link = link(&rom).await;
        let err = RomFlasher::new().connect(&mut link).await.unwrap_err();
        assert!(err.to_string().contains("0xdeadbeef"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_digest_mismatch_fails_verify() {
        let rom = FakeRom::new(0x6921_506F);
        rom.sim().corrupt_after_write = true;
        let mut link = link(&rom).await;
        let flasher = RomFlasher::new();

        assert_eq!(flasher.connect(&mut link).await.unwrap(), "ESP32-C3");
        flasher.erase(&mut link, 0, 16).await.unwrap();
        flasher.write(&mut link, 0, &[0x42; 16]).await.unwrap();
        assert!(matches!(
            flasher.verify(&mut link, 0, &[0x42; 16]).await,
            Err(FlashError::Verify { offset: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_outside_erased_region() {
        let rom = FakeRom::new(0x00F0_1D83);
        let mut link = link(&rom).await;
        let flasher = RomFlasher::new();
        flasher.connect(&mut link).await.unwrap();
        let err = flasher.write(&mut link, 0x8000, &[1]).await.unwrap_err();
        assert!(err.to_string().contains("outside an erased region"));
    }
}
