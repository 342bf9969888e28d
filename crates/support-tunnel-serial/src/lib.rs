//! Device link ownership for the requester side.
//!
//! Provides:
//! - `SerialLink` / `LinkOpener` - The link abstraction
//! - `LinkGuard` - Exclusive, scoped ownership with reopen and write queueing
//! - `SerialPortDevice` - OS serial ports with baud and DTR/RTS control
//! - `DeviceFile` - Pre-configured character devices (no baud or control lines)
//! - `LoopbackDevice` - In-memory device for tests and demos
//! - Reset and bootloader control sequences

pub mod control;
pub mod device;
pub mod guard;
pub mod link;
pub mod loopback;
pub mod port;

pub use control::{BOOTLOADER_SEQUENCE, RESET_SEQUENCE, SignalStep, run_sequence};
pub use device::DeviceFile;
pub use guard::LinkGuard;
pub use link::{LinkError, LinkOpener, SerialLink};
pub use loopback::LoopbackDevice;
pub use port::SerialPortDevice;
