//! Firmware flashing for the support tunnel.
//!
//! Provides:
//! - `FlashOrchestrator` - Phased flash runs with ordered progress reports
//! - `Flasher` - Chip programming trait, with `RomFlasher` (ESP serial ROM
//!   loader over the device link) and `MemoryFlasher`
//! - `FirmwareSource` - Manifest and image fetching, with memory and HTTP sources
//! - ESP Web Tools manifest model

pub mod error;
pub mod flasher;
pub mod manifest;
pub mod orchestrator;
pub mod rom;
pub mod source;

pub use error::FlashError;
pub use flasher::{Flasher, MemoryFlasher};
pub use manifest::{Build, Manifest, Part};
pub use orchestrator::{FlashOrchestrator, FlashOutcome, ProgressSink, ProgressTracker};
pub use rom::{Chip, RomFlasher};
#[cfg(feature = "http")]
pub use source::HttpFirmwareSource;
pub use source::{FirmwareSource, MemoryFirmwareSource};
