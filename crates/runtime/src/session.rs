//! Session lifecycle.

use std::sync::Arc;
use std::time::Duration;

use policy::Policy;
use storage::{EventStore, SessionId};

use crate::authority::{Authority, DEFAULT_TOKEN_TTL, StatusSnapshot};
use crate::challenge::ChallengeKind;
use crate::Result;

/// Settings for a new session.
pub struct SessionConfig {
    pub policy: Policy,
    pub challenge: ChallengeKind,
    pub token_ttl: Duration,
    pub audit: Option<EventStore>,
}

impl SessionConfig {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            challenge: ChallengeKind::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
            audit: None,
        }
    }

    pub fn with_audit(mut self, store: EventStore) -> Self {
        self.audit = Some(store);
        self
    }
}

/// An explicitly owned capability session.
///
/// Collaborators receive the authority handle from [`Session::authority`].
/// Ending the session (by [`Session::teardown`] or by dropping it) drops all
/// step-up grants and cancels pending checkpoints; the handle stays valid but
/// every check on it returns false.
pub struct Session {
    authority: Arc<Authority>,
}

impl Session {
    /// Start a session bound to the calling process.
    pub fn init(config: SessionConfig) -> Result<Self> {
        let mut builder = Authority::builder(config.policy)
            .challenge(config.challenge)
            .token_ttl(config.token_ttl);
        if let Some(store) = config.audit {
            builder = builder.audit(store);
        }
        Ok(Self::start(builder.build()?))
    }

    /// Wrap an authority built elsewhere.
    pub fn start(authority: Authority) -> Self {
        Self {
            authority: Arc::new(authority),
        }
    }

    pub fn id(&self) -> SessionId {
        self.authority.session_id()
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn status(&self) -> StatusSnapshot {
        self.authority.status()
    }

    /// End the session.
    pub fn teardown(self) {
        self.authority.end();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.authority.end();
    }
}
