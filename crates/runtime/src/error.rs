use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acc::{ConfirmationToken, TokenId};

/// Runtime errors.
///
/// Local kinds (`TokenExpired`, `TokenConsumed`, `AlreadyPending`,
/// `ChallengeRejected`) are returned to the caller and leave the session
/// usable. `SessionHalted` and `IdentityMismatch` are also recorded in shared
/// session state, so every later operation observes them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session halted: {0}")]
    SessionHalted(String),

    #[error("process identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("capability denied: {0}")]
    PolicyDenied(String),

    #[error("confirmation token {0} expired before a response was received")]
    TokenExpired(TokenId),

    #[error("confirmation token {0} has already been used")]
    TokenConsumed(TokenId),

    #[error("unknown confirmation token: {0}")]
    UnknownToken(TokenId),

    #[error("an escalation for {} is already pending as token {}", .0.capability, .0.id)]
    AlreadyPending(Box<ConfirmationToken>),

    #[error("challenge response for token {0} was not accepted")]
    ChallengeRejected(TokenId),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}

impl Error {
    /// Classify this error for a denial record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SessionHalted(_) => ErrorKind::SessionHalted,
            Error::IdentityMismatch(_) => ErrorKind::IdentityMismatch,
            Error::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Error::TokenExpired(_) => ErrorKind::TokenExpired,
            Error::TokenConsumed(_) => ErrorKind::TokenConsumed,
            Error::UnknownToken(_) => ErrorKind::UnknownToken,
            Error::AlreadyPending(_) => ErrorKind::AlreadyPending,
            Error::ChallengeRejected(_) => ErrorKind::ChallengeRejected,
            Error::Config(_) | Error::Storage(_) | Error::Policy(_) => ErrorKind::Internal,
        }
    }

    /// True for kinds that end the session.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// Error classification carried in denial records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Routine: the capability is simply not granted.
    CapabilityAbsent,
    SessionHalted,
    IdentityMismatch,
    PolicyDenied,
    TokenExpired,
    TokenConsumed,
    UnknownToken,
    AlreadyPending,
    ChallengeRejected,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapabilityAbsent => "capability_absent",
            ErrorKind::SessionHalted => "session_halted",
            ErrorKind::IdentityMismatch => "identity_mismatch",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenConsumed => "token_consumed",
            ErrorKind::UnknownToken => "unknown_token",
            ErrorKind::AlreadyPending => "already_pending",
            ErrorKind::ChallengeRejected => "challenge_rejected",
            ErrorKind::Internal => "internal",
        }
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::SessionHalted | ErrorKind::IdentityMismatch)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
