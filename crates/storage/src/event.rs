//! Event types for the audit log.

use chrono::{DateTime, Utc};
use policy::Capability;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// How a consent checkpoint ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// The response was accepted and the capability granted.
    Confirmed,
    /// Dismissed by the user, or cancelled by a halt or teardown.
    Dismissed,
    /// The token lapsed before a response arrived.
    Expired,
    /// The response did not satisfy the challenge.
    Rejected,
}

impl EscalationOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EscalationOutcome::Confirmed => "confirmed",
            EscalationOutcome::Dismissed => "dismissed",
            EscalationOutcome::Expired => "expired",
            EscalationOutcome::Rejected => "rejected",
        }
    }
}

/// The kind of event that occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Session started and bound to a process.
    SessionStart { pid: u32 },
    /// Session ended.
    SessionEnd,
    /// A grant was added.
    GrantAdded {
        capability: Capability,
        ephemeral: bool,
    },
    /// Grants for a capability were revoked.
    GrantRevoked { capability: Capability, count: usize },
    /// A request was denied for a reason other than a missing grant.
    Denied {
        capabilities: Vec<Capability>,
        reason: String,
        error_kind: String,
        message: String,
    },
    /// A consent checkpoint was opened.
    EscalationRequested {
        token_id: Uuid,
        capability: Capability,
        reason: String,
    },
    /// A consent checkpoint reached a terminal state.
    EscalationSettled {
        token_id: Uuid,
        capability: Capability,
        outcome: EscalationOutcome,
    },
    /// The session was halted.
    Halted { message: String },
}

impl EventKind {
    /// Stable name stored in the `kind` column.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SessionStart { .. } => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::GrantAdded { .. } => "grant_added",
            EventKind::GrantRevoked { .. } => "grant_revoked",
            EventKind::Denied { .. } => "denied",
            EventKind::EscalationRequested { .. } => "escalation_requested",
            EventKind::EscalationSettled { .. } => "escalation_settled",
            EventKind::Halted { .. } => "halted",
        }
    }
}

/// An event in the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(session_id: SessionId, kind: EventKind) -> Self {
        Self::at(session_id, kind, Utc::now())
    }

    /// Create an event stamped with a caller-supplied time.
    pub fn at(session_id: SessionId, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            timestamp,
            kind,
        }
    }
}
