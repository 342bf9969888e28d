//! DTR/RTS control sequences.

use std::time::Duration;

use crate::{guard::LinkGuard, link::LinkError};

/// One step of a control-line sequence: set the lines, then hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStep {
    pub dtr: bool,
    pub rts: bool,
    pub hold: Duration,
}

const fn step(dtr: bool, rts: bool, hold_ms: u64) -> SignalStep {
    SignalStep {
        dtr,
        rts,
        hold: Duration::from_millis(hold_ms),
    }
}

/// Pulse EN low and release it: the chip restarts into its application.
pub const RESET_SEQUENCE: &[SignalStep] = &[step(false, true, 100), step(false, false, 0)];

/// Hold IO0 low across the EN release: the chip restarts into the ROM loader.
pub const BOOTLOADER_SEQUENCE: &[SignalStep] = &[
    step(false, true, 100),
    step(true, false, 50),
    step(false, false, 0),
];

/// Apply `steps` in order.
///
/// # Errors
/// Returns error at the first step the link rejects.
pub async fn run_sequence(guard: &mut LinkGuard, steps: &[SignalStep]) -> Result<(), LinkError> {
    for s in steps {
        guard.set_signals(s.dtr, s.rts)?;
        if !s.hold.is_zero() {
            tokio::time::sleep(s.hold).await;
        }
    }
    Ok(())
}
