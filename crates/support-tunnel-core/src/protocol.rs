//! Wire protocol: the `{ "event", "payload" }` envelope exchanged on a session topic.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ProtocolError, session::CloseReason};

/// Serial data carried by `serial_output` and `serial_input`.
///
/// Either plain `text`, or base64 `data` tagged with `binary: true`. The
/// optional `chunk` sequences the parts of one oversized read; every chunk
/// decodes on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u32>,
}

impl SerialData {
    /// Plain text payload.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Binary payload, base64 encoded.
    #[must_use]
    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            data: Some(BASE64.encode(bytes)),
            binary: true,
            ..Self::default()
        }
    }

    /// Split `bytes` into binary payloads of at most `max_bytes` raw bytes.
    ///
    /// A buffer that fits is sent without a `chunk` index.
    #[must_use]
    pub fn chunked(bytes: &[u8], max_bytes: usize) -> Vec<Self> {
        let max_bytes = max_bytes.max(1);
        if bytes.len() <= max_bytes {
            return vec![Self::binary(bytes)];
        }
        bytes
            .chunks(max_bytes)
            .zip(0u32..)
            .map(|(part, index)| Self {
                chunk: Some(index),
                ..Self::binary(part)
            })
            .collect()
    }

    /// Bytes to write to (or render from) the device.
    ///
    /// # Errors
    /// Returns error if the payload is empty or `data` is not valid base64.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        match (&self.data, &self.text) {
            (Some(data), text) if self.binary || text.is_none() => {
                BASE64.decode(data).map_err(|e| ProtocolError::InvalidPayload {
                    event: "serial_data",
                    reason: e.to_string(),
                })
            }
            (_, Some(text)) => Ok(text.as_bytes().to_vec()),
            _ => Err(ProtocolError::InvalidPayload {
                event: "serial_data",
                reason: "neither text nor data present".into(),
            }),
        }
    }
}

/// Reflash phase.
///
/// Declaration order is the only legal forward order; `Error` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashPhase {
    Idle,
    Connecting,
    Erasing,
    Flashing,
    Verifying,
    Resetting,
    Complete,
    Error,
}

impl FlashPhase {
    /// Phase that follows this one in a successful run.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Connecting),
            Self::Connecting => Some(Self::Erasing),
            Self::Erasing => Some(Self::Flashing),
            Self::Flashing => Some(Self::Verifying),
            Self::Verifying => Some(Self::Resetting),
            Self::Resetting => Some(Self::Complete),
            Self::Complete | Self::Error => None,
        }
    }

    /// Whether a run is in progress in this phase.
    #[must_use]
    pub const fn is_running(self) -> bool {
        !matches!(self, Self::Idle | Self::Complete | Self::Error)
    }
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Erasing => "erasing",
            Self::Flashing => "flashing",
            Self::Verifying => "verifying",
            Self::Resetting => "resetting",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashProgress {
    pub phase: FlashPhase,
    pub percent: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub chip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Device-control actions the operator may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reset,
    Bootloader,
    Flash,
    FlashAbort,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Bootloader => "bootloader",
            Self::Flash => "flash",
            Self::FlashAbort => "flash_abort",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(rename = "manifestUrl", default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
}

impl Action {
    #[must_use]
    pub const fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            manifest_url: None,
        }
    }

    #[must_use]
    pub fn flash(manifest_url: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Flash,
            manifest_url: Some(manifest_url.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: ActionKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    #[must_use]
    pub const fn ok(action: ActionKind) -> Self {
        Self {
            action,
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(action: ActionKind, error: impl Into<String>) -> Self {
        Self {
            action,
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Whether the requester currently holds an open device link.
    pub connected: bool,
    /// Requester clock, Unix epoch milliseconds.
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaudRate {
    pub rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub dtr: bool,
    pub rts: bool,
}

/// Announces an operator-side tool attached to the session, such as a
/// local serial port bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimHello {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Which endpoint is expected to publish an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Requester → operator.
    ToOperator,
    /// Operator → requester.
    ToRequester,
    /// Either endpoint.
    Both,
}

/// One protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    SerialOutput(SerialData),
    FlashProgress(FlashProgress),
    DeviceInfo(DeviceInfo),
    ActionResult(ActionResult),
    Heartbeat(Heartbeat),
    BaudAck(BaudRate),
    SerialInput(SerialData),
    Action(Action),
    SessionEnd(SessionEnd),
    Signal(Signal),
    SetBaud(BaudRate),
    ShimHello(ShimHello),
}

#[derive(Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    /// Every event name this implementation understands.
    pub const EVENT_NAMES: [&'static str; 12] = [
        "serial_output",
        "flash_progress",
        "device_info",
        "action_result",
        "heartbeat",
        "baud_ack",
        "serial_input",
        "action",
        "session_end",
        "signal",
        "set_baud",
        "shim_hello",
    ];

    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::SerialOutput(_) => "serial_output",
            Self::FlashProgress(_) => "flash_progress",
            Self::DeviceInfo(_) => "device_info",
            Self::ActionResult(_) => "action_result",
            Self::Heartbeat(_) => "heartbeat",
            Self::BaudAck(_) => "baud_ack",
            Self::SerialInput(_) => "serial_input",
            Self::Action(_) => "action",
            Self::SessionEnd(_) => "session_end",
            Self::Signal(_) => "signal",
            Self::SetBaud(_) => "set_baud",
            Self::ShimHello(_) => "shim_hello",
        }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::SerialOutput(_)
            | Self::FlashProgress(_)
            | Self::DeviceInfo(_)
            | Self::ActionResult(_)
            | Self::Heartbeat(_)
            | Self::BaudAck(_) => Direction::ToOperator,
            Self::SerialInput(_)
            | Self::Action(_)
            | Self::Signal(_)
            | Self::SetBaud(_)
            | Self::ShimHello(_) => Direction::ToRequester,
            Self::SessionEnd(_) => Direction::Both,
        }
    }

    /// Whether an endpoint receiving in `direction` should act on this event.
    #[must_use]
    pub fn is_for(&self, direction: Direction) -> bool {
        let own = self.direction();
        own == Direction::Both || own == direction
    }

    /// Serialize to a JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse a JSON frame.
    ///
    /// Unknown event names are reported as [`ProtocolError::UnknownEvent`] so
    /// callers can ignore them without treating the frame as corrupt.
    ///
    /// # Errors
    /// Returns error if the frame is not an envelope, names an unknown event,
    /// or carries a payload of the wrong shape.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let Some(&event) = Self::EVENT_NAMES.iter().find(|name| **name == raw.event) else {
            return Err(ProtocolError::UnknownEvent(raw.event));
        };

        serde_json::from_value(serde_json::json!({ "event": event, "payload": raw.payload }))
            .map_err(|e| ProtocolError::InvalidPayload {
                event,
                reason: e.to_string(),
            })
    }
}
