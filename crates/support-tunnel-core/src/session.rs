//! Session record and its lifecycle state machine.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Current wall clock as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Session status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created by the requester, no operator yet.
    Waiting,
    /// An operator has joined.
    Active,
    /// Terminal.
    Closed,
}

impl SessionStatus {
    /// Whether `self → next` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Active | Self::Closed) | (Self::Active, Self::Closed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            _ => Err(UnknownValue::new("session status", s)),
        }
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserEnded,
    AdminEnded,
    Timeout,
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserEnded => "user_ended",
            Self::AdminEnded => "admin_ended",
            Self::Timeout => "timeout",
            Self::Error => "error",
        })
    }
}

impl FromStr for CloseReason {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_ended" => Ok(Self::UserEnded),
            "admin_ended" => Ok(Self::AdminEnded),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            _ => Err(UnknownValue::new("close reason", s)),
        }
    }
}

/// A stored name that does not map to a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownValue {
    kind: &'static str,
    value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

/// Device metadata supplied by the device identity collaborator at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHint {
    pub serial: Option<String>,
    pub chip: Option<String>,
    pub firmware: Option<String>,
}

/// Rejected lifecycle transition. The session is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Session {0} is closed")]
    Closed(SessionId),
    #[error("Session {id} cannot move from {from} to {to}")]
    Invalid {
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("Session {0} already has an operator")]
    OperatorAlreadySet(SessionId),
    #[error("Session {0} cannot become active without an operator")]
    MissingOperator(SessionId),
    #[error("Session {0} needs a close reason")]
    MissingReason(SessionId),
}

/// Partial update applied through the session store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub operator_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub joined_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub close_reason: Option<CloseReason>,
}

impl SessionUpdate {
    /// The waiting → active transition.
    #[must_use]
    pub fn join(operator_id: impl Into<String>, now: i64) -> Self {
        Self {
            operator_id: Some(operator_id.into()),
            status: Some(SessionStatus::Active),
            joined_at: Some(now),
            ..Self::default()
        }
    }

    /// The → closed transition.
    #[must_use]
    pub fn close(reason: CloseReason, now: i64) -> Self {
        Self {
            status: Some(SessionStatus::Closed),
            closed_at: Some(now),
            close_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Persisted session data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub requester_id: String,
    pub operator_id: Option<String>,
    pub status: SessionStatus,
    pub device_serial: Option<String>,
    pub device_chip: Option<String>,
    pub device_firmware: Option<String>,
    pub created_at: i64,
    pub joined_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub close_reason: Option<CloseReason>,
}

impl Session {
    /// A fresh waiting session.
    #[must_use]
    pub fn new(requester_id: impl Into<String>, device: DeviceHint, now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id: requester_id.into(),
            operator_id: None,
            status: SessionStatus::Waiting,
            device_serial: device.serial,
            device_chip: device.chip,
            device_firmware: device.firmware,
            created_at: now,
            joined_at: None,
            closed_at: None,
            close_reason: None,
        }
    }

    /// Relay topic carrying this session's envelopes.
    #[must_use]
    pub fn topic(&self) -> String {
        topic_for(self.id)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Apply `update` atomically: either every field changes or none does.
    ///
    /// # Errors
    /// Returns error if the update would break a lifecycle invariant.
    pub fn apply(&mut self, update: SessionUpdate) -> Result<(), TransitionError> {
        if self.is_closed() {
            return Err(TransitionError::Closed(self.id));
        }

        let mut next = self.clone();

        if let Some(operator_id) = update.operator_id {
            if next.operator_id.is_some() {
                return Err(TransitionError::OperatorAlreadySet(self.id));
            }
            next.operator_id = Some(operator_id);
        }

        if let Some(status) = update.status {
            if !self.status.can_become(status) {
                return Err(TransitionError::Invalid {
                    id: self.id,
                    from: self.status,
                    to: status,
                });
            }
            next.status = status;
            match status {
                SessionStatus::Active => {
                    next.joined_at = Some(update.joined_at.unwrap_or_else(now_millis));
                }
                SessionStatus::Closed => {
                    next.close_reason =
                        Some(update.close_reason.ok_or(TransitionError::MissingReason(self.id))?);
                    next.closed_at = Some(update.closed_at.unwrap_or_else(now_millis));
                }
                SessionStatus::Waiting => {}
            }
        }

        // operator_id is only ever assigned together with activation
        if next.operator_id != self.operator_id && next.status != SessionStatus::Active {
            return Err(TransitionError::Invalid {
                id: self.id,
                from: self.status,
                to: next.status,
            });
        }
        if next.status == SessionStatus::Active && next.operator_id.is_none() {
            return Err(TransitionError::MissingOperator(self.id));
        }

        *self = next;
        Ok(())
    }

    /// waiting → active.
    ///
    /// # Errors
    /// Returns error unless the session is waiting.
    pub fn join(&mut self, operator_id: impl Into<String>, now: i64) -> Result<(), TransitionError> {
        self.apply(SessionUpdate::join(operator_id, now))
    }

    /// waiting | active → closed.
    ///
    /// # Errors
    /// Returns error if the session is already closed.
    pub fn close(&mut self, reason: CloseReason, now: i64) -> Result<(), TransitionError> {
        self.apply(SessionUpdate::close(reason, now))
    }
}

/// Relay topic for a session id.
#[must_use]
pub fn topic_for(id: SessionId) -> String {
    format!("support:{id}")
}
