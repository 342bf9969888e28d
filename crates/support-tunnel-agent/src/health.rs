//! Bridge health derived from requester heartbeats.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use support_tunnel_core::{
    TunnelConfig,
    terminal::{LineLevel, TerminalLine},
};
use tokio::time::Instant;

/// Operator-side view of the requester bridge. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeHealth {
    Unknown,
    Healthy,
    Degraded,
    Disconnected,
}

impl BridgeHealth {
    const fn severity(self) -> u8 {
        match self {
            Self::Unknown | Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Disconnected => 2,
        }
    }
}

impl fmt::Display for BridgeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        })
    }
}

/// A health transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub from: BridgeHealth,
    pub to: BridgeHealth,
}

impl HealthChange {
    /// Render as a `system` terminal line.
    #[must_use]
    pub fn to_line(&self) -> TerminalLine {
        let level = match self.to {
            BridgeHealth::Unknown | BridgeHealth::Healthy => LineLevel::Info,
            BridgeHealth::Degraded => LineLevel::Warn,
            BridgeHealth::Disconnected => LineLevel::Error,
        };
        TerminalLine::system(level, format!("Bridge {} (was {})", self.to, self.from))
    }
}

/// Tracks heartbeat recency.
///
/// Silence is measured from the last heartbeat, or from monitor start when
/// none has arrived. Silence of `degraded_after` intervals degrades the
/// bridge, `disconnected_after` intervals disconnects it. Only a heartbeat
/// makes it healthy again.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: BridgeHealth,
    degraded_after: Duration,
    disconnected_after: Duration,
    started: Instant,
    last_heartbeat: Option<Instant>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: &TunnelConfig, now: Instant) -> Self {
        Self::with_thresholds(
            config.heartbeat_interval(),
            config.degraded_after_intervals,
            config.disconnected_after_intervals,
            now,
        )
    }

    #[must_use]
    pub fn with_thresholds(
        interval: Duration,
        degraded_after: u32,
        disconnected_after: u32,
        now: Instant,
    ) -> Self {
        Self {
            state: BridgeHealth::Unknown,
            degraded_after: interval * degraded_after,
            disconnected_after: interval * disconnected_after.max(degraded_after),
            started: now,
            last_heartbeat: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> BridgeHealth {
        self.state
    }

    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    fn set(&mut self, to: BridgeHealth) -> Option<HealthChange> {
        if self.state == to {
            return None;
        }
        let change = HealthChange {
            from: self.state,
            to,
        };
        self.state = to;
        tracing::info!(from = %change.from, to = %change.to, "Bridge health changed");
        Some(change)
    }

    /// A heartbeat arrived.
    pub fn record_heartbeat(&mut self, now: Instant) -> Option<HealthChange> {
        self.last_heartbeat = Some(now);
        self.set(BridgeHealth::Healthy)
    }

    /// Re-evaluate silence at `now`. Never upgrades.
    pub fn evaluate(&mut self, now: Instant) -> Option<HealthChange> {
        let silent = now.saturating_duration_since(self.last_heartbeat.unwrap_or(self.started));
        let target = if silent >= self.disconnected_after {
            BridgeHealth::Disconnected
        } else if silent >= self.degraded_after {
            BridgeHealth::Degraded
        } else {
            return None;
        };
        if target.severity() > self.state.severity() {
            self.set(target)
        } else {
            None
        }
    }

    /// The relay subscription failed.
    pub fn mark_disconnected(&mut self) -> Option<HealthChange> {
        self.set(BridgeHealth::Disconnected)
    }
}
