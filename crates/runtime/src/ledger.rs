//! Denial and halt bookkeeping.

use chrono::{DateTime, Utc};
use policy::Capability;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::ErrorKind;

/// Number of denials kept for diagnostics beyond the most recent one.
pub const MAX_DENIAL_HISTORY: usize = 1024;

/// What was asked for when a denial happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedRequest {
    /// One capability for a single check, all of them for a composite check.
    pub capabilities: Vec<Capability>,
    pub reason: String,
}

/// Why it was denied. `message` is literal and may be displayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialRecord {
    pub request: DeniedRequest,
    pub error: DenialError,
    pub timestamp: DateTime<Utc>,
}

impl DenialRecord {
    pub fn new(
        capabilities: Vec<Capability>,
        reason: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request: DeniedRequest {
                capabilities,
                reason: reason.into(),
            },
            error: DenialError {
                kind,
                message: message.into(),
            },
            timestamp,
        }
    }
}

/// Why and when a session was halted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub message: String,
    pub halted_at: DateTime<Utc>,
}

/// The most recent denial, a bounded history, and the one-way halt flag.
#[derive(Debug, Default)]
pub struct DenialLedger {
    history: VecDeque<DenialRecord>,
    halt: Option<HaltRecord>,
}

impl DenialLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: DenialRecord) {
        if self.history.len() == MAX_DENIAL_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn last(&self) -> Option<&DenialRecord> {
        self.history.back()
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &DenialRecord> {
        self.history.iter()
    }

    /// Enter the halted state. Returns `false` if already halted, in which
    /// case the first halt record is kept.
    pub fn halt(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.halt.is_some() {
            return false;
        }
        self.halt = Some(HaltRecord {
            message: message.into(),
            halted_at: at,
        });
        true
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    pub fn halt_record(&self) -> Option<&HaltRecord> {
        self.halt.as_ref()
    }
}
