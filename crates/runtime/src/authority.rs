//! The capability authority: the single answer to "is this allowed".
//!
//! All mutable state sits behind one mutex, so a halt is visible to every
//! check that follows it and a token can be consumed at most once. The
//! challenge bridge is always called with the lock released.

use chrono::{DateTime, Utc};
use policy::{Capability, Decision, Grant, GrantStore, Policy};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use storage::{EscalationOutcome, Event, EventKind, EventStore, SessionId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::acc::{Checkpoint, ConfirmationToken, EscalationState, TokenId};
use crate::challenge::{ChallengeBridge, ChallengeKind, HashedChallengeBridge};
use crate::clock::{Clock, SystemClock};
use crate::identity::{IdentityGuard, ProcessIdentity, Verification};
use crate::ledger::{DenialLedger, DenialRecord, HaltRecord};
use crate::{Error, ErrorKind, Result};

/// Lifetime of a confirmation token unless configured otherwise.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Read-only view of a session for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub session_id: SessionId,
    pub is_halted: bool,
    pub halt: Option<HaltRecord>,
    pub last_denial: Option<DenialRecord>,
    pub active_grants: BTreeSet<Capability>,
    pub process_identity: ProcessIdentity,
    pub pending: Vec<ConfirmationToken>,
}

/// Builder for [`Authority`].
pub struct AuthorityBuilder {
    policy: Policy,
    session_id: SessionId,
    identity: Option<ProcessIdentity>,
    clock: Arc<dyn Clock>,
    bridge: Option<Arc<dyn ChallengeBridge>>,
    challenge: ChallengeKind,
    token_ttl: Duration,
    audit: Option<EventStore>,
}

impl AuthorityBuilder {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            session_id: SessionId::new(),
            identity: None,
            clock: Arc::new(SystemClock),
            bridge: None,
            challenge: ChallengeKind::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
            audit: None,
        }
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Bind to a specific identity instead of the calling process.
    pub fn identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an external challenge bridge. Overrides [`AuthorityBuilder::challenge`].
    pub fn bridge(mut self, bridge: Arc<dyn ChallengeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Challenge style for the built-in bridge.
    pub fn challenge(mut self, kind: ChallengeKind) -> Self {
        self.challenge = kind;
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Record audit events to `store`.
    pub fn audit(mut self, store: EventStore) -> Self {
        self.audit = Some(store);
        self
    }

    pub fn build(self) -> Result<Authority> {
        self.policy.validate()?;
        if self.token_ttl.is_zero() {
            return Err(Error::Config("token ttl must be greater than zero".into()));
        }
        let token_ttl = chrono::Duration::from_std(self.token_ttl)
            .map_err(|e| Error::Config(format!("token ttl out of range: {e}")))?;

        let now = self.clock.now();
        if now.checked_add_signed(token_ttl).is_none() {
            return Err(Error::Config(format!(
                "token ttl of {}s is too large",
                self.token_ttl.as_secs()
            )));
        }
        let identity = self
            .identity
            .unwrap_or_else(|| ProcessIdentity::current(now));
        let bridge: Arc<dyn ChallengeBridge> = match self.bridge {
            Some(bridge) => bridge,
            None => Arc::new(HashedChallengeBridge::new(self.challenge)),
        };

        let mut state = State {
            grants: GrantStore::new(),
            checkpoint: Checkpoint::new(),
            ledger: DenialLedger::new(),
            ended_at: None,
            audit: self.audit,
        };
        state.write(self.session_id, EventKind::SessionStart { pid: identity.pid }, now);
        for capability in self.policy.standing_grants() {
            state.grants.add_grant(Grant::standing(capability, now));
            state.write(
                self.session_id,
                EventKind::GrantAdded {
                    capability,
                    ephemeral: false,
                },
                now,
            );
        }

        let snapshot = state.snapshot(self.session_id, identity);
        let (status, _) = watch::channel(snapshot);

        info!(
            session = %self.session_id,
            pid = identity.pid,
            grants = state.grants.len(),
            "capability session started"
        );

        Ok(Authority {
            session_id: self.session_id,
            policy: self.policy,
            identity: IdentityGuard::new(identity),
            clock: self.clock,
            bridge,
            token_ttl,
            state: Mutex::new(state),
            status,
        })
    }
}

struct State {
    grants: GrantStore,
    checkpoint: Checkpoint,
    ledger: DenialLedger,
    ended_at: Option<DateTime<Utc>>,
    audit: Option<EventStore>,
}

impl State {
    fn write(&self, session_id: SessionId, kind: EventKind, at: DateTime<Utc>) {
        let Some(store) = &self.audit else {
            return;
        };
        if let Err(e) = store.append(&Event::at(session_id, kind, at)) {
            warn!(session = %session_id, error = %e, "failed to write audit event");
        }
    }

    /// Why nothing may proceed, if anything.
    fn closed(&self) -> Option<String> {
        if let Some(halt) = self.ledger.halt_record() {
            return Some(format!("session halted: {}", halt.message));
        }
        self.ended_at
            .map(|at| format!("session ended at {}", at.to_rfc3339()))
    }

    fn snapshot(&self, session_id: SessionId, identity: ProcessIdentity) -> StatusSnapshot {
        StatusSnapshot {
            session_id,
            is_halted: self.ledger.is_halted(),
            halt: self.ledger.halt_record().cloned(),
            last_denial: self.ledger.last().cloned(),
            active_grants: self.grants.list_active(),
            process_identity: identity,
            pending: self.checkpoint.pending(),
        }
    }
}

/// Why a single capability check came back false.
enum Refusal {
    /// Routine; never recorded for single checks.
    Absent,
    Closed(String),
    Denied(String),
}

impl Refusal {
    fn kind(&self) -> ErrorKind {
        match self {
            Refusal::Absent => ErrorKind::CapabilityAbsent,
            Refusal::Closed(_) => ErrorKind::SessionHalted,
            Refusal::Denied(_) => ErrorKind::PolicyDenied,
        }
    }
}

/// Governs which privileged actions a session may perform.
pub struct Authority {
    session_id: SessionId,
    policy: Policy,
    identity: IdentityGuard,
    clock: Arc<dyn Clock>,
    bridge: Arc<dyn ChallengeBridge>,
    token_ttl: chrono::Duration,
    state: Mutex<State>,
    status: watch::Sender<StatusSnapshot>,
}

impl Authority {
    pub fn builder(policy: Policy) -> AuthorityBuilder {
        AuthorityBuilder::new(policy)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn process_identity(&self) -> ProcessIdentity {
        *self.identity.bound()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Whether `capability` can only be obtained through a consent checkpoint.
    pub fn requires_step_up(&self, capability: Capability) -> bool {
        self.policy.requires_step_up(capability)
    }

    /// True iff the session is live and a grant for `capability` is held.
    ///
    /// A missing grant is an ordinary `false`. Denials caused by a halted
    /// session or by the deny policy are recorded.
    pub fn check(&self, capability: Capability, reason: &str) -> bool {
        let mut state = self.lock();
        match self.evaluate(&state, capability) {
            Ok(()) => {
                debug!(session = %self.session_id, %capability, reason, "capability allowed");
                true
            }
            Err(Refusal::Absent) => {
                debug!(session = %self.session_id, %capability, reason, "capability not granted");
                false
            }
            Err(refusal) => {
                let kind = refusal.kind();
                if let Refusal::Closed(message) | Refusal::Denied(message) = refusal {
                    self.deny(&mut state, vec![capability], reason, kind, message);
                    self.publish(&state);
                }
                false
            }
        }
    }

    /// True iff every capability individually checks true.
    ///
    /// Stops at the first failure and records exactly one denial describing
    /// the whole request.
    pub fn check_all_of(&self, capabilities: &[Capability], reason: &str) -> bool {
        let mut state = self.lock();
        let refusal = match state.closed() {
            Some(message) => Some((None, Refusal::Closed(message))),
            None => capabilities.iter().find_map(|&capability| {
                self.evaluate(&state, capability)
                    .err()
                    .map(|refusal| (Some(capability), refusal))
            }),
        };

        let Some((failed, refusal)) = refusal else {
            debug!(session = %self.session_id, ?capabilities, reason, "all capabilities allowed");
            return true;
        };

        let required = capabilities
            .iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let kind = refusal.kind();
        let message = match (refusal, failed) {
            (Refusal::Closed(message), _) => message,
            (Refusal::Denied(why), _) => format!("{why}; required all of [{required}]"),
            (Refusal::Absent, Some(capability)) => {
                format!("{capability} is not granted; required all of [{required}]")
            }
            (Refusal::Absent, None) => format!("required all of [{required}]"),
        };
        self.deny(&mut state, capabilities.to_vec(), reason, kind, message);
        self.publish(&state);
        false
    }

    /// Open a consent checkpoint for `capability`.
    ///
    /// Does not grant anything. Only capabilities the policy marks as step-up
    /// can be escalated; any other capability fails with `PolicyDenied`,
    /// recorded only when the policy denies it outright. If an equivalent
    /// request is already pending the existing token is returned inside
    /// [`Error::AlreadyPending`].
    pub fn request_escalation(
        &self,
        capability: Capability,
        reason: &str,
    ) -> Result<ConfirmationToken> {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            self.ensure_open(&state)?;
            match self.policy.evaluate(capability) {
                Decision::Deny { reason: why } => {
                    self.deny(
                        &mut state,
                        vec![capability],
                        reason,
                        ErrorKind::PolicyDenied,
                        why.clone(),
                    );
                    self.publish(&state);
                    return Err(Error::PolicyDenied(why));
                }
                Decision::Grantable => {
                    return Err(Error::PolicyDenied(format!(
                        "{capability} cannot be obtained through a consent checkpoint"
                    )));
                }
                Decision::StepUp => {}
            }
            if let Some(existing) = state.checkpoint.pending_for(capability, reason, now) {
                return Err(Error::AlreadyPending(Box::new(existing.clone())));
            }
        }

        let expires_at = now.checked_add_signed(self.token_ttl).ok_or_else(|| {
            Error::Config(format!("token expiry overflows at {}", now.to_rfc3339()))
        })?;
        let id = TokenId::new();
        let token = ConfirmationToken {
            id,
            capability,
            reason: reason.to_string(),
            challenge_payload: self.bridge.issue(id, capability),
            issued_at: now,
            expires_at,
        };

        let opened = {
            let mut state = self.lock();
            let opened = self
                .ensure_open(&state)
                .and_then(|()| state.checkpoint.open(token.clone()));
            if let Ok(lapsed) = &opened {
                if let Some(lapsed) = lapsed {
                    self.record_expired(&mut state, lapsed, now);
                }
                state.write(
                    self.session_id,
                    EventKind::EscalationRequested {
                        token_id: id.0,
                        capability,
                        reason: reason.to_string(),
                    },
                    now,
                );
                info!(
                    session = %self.session_id,
                    token = %id,
                    %capability,
                    reason,
                    expires_at = %token.expires_at,
                    "consent checkpoint opened"
                );
                self.publish(&state);
            }
            opened
        };

        match opened {
            Ok(lapsed) => {
                if let Some(lapsed) = lapsed {
                    self.bridge.discard(lapsed.id);
                }
                Ok(token)
            }
            Err(e) => {
                self.bridge.discard(id);
                Err(e)
            }
        }
    }

    /// Answer a pending checkpoint.
    ///
    /// The token is consumed whatever the outcome. On an accepted response
    /// an ephemeral grant for the token's capability is added.
    pub fn confirm_escalation(&self, id: TokenId, response: &str) -> Result<()> {
        let token = self.take(id)?;

        let accepted = self.bridge.verify(id, response);
        self.bridge.discard(id);

        let now = self.clock.now();
        let mut state = self.lock();
        if let Err(e) = self.ensure_open(&state) {
            state.checkpoint.settle(id, EscalationOutcome::Dismissed);
            self.settled(&state, &token, EscalationOutcome::Dismissed, now);
            return Err(e);
        }

        if accepted {
            state.checkpoint.settle(id, EscalationOutcome::Confirmed);
            state.grants.add_grant(Grant::ephemeral(token.capability, now));
            state.write(
                self.session_id,
                EventKind::GrantAdded {
                    capability: token.capability,
                    ephemeral: true,
                },
                now,
            );
            self.settled(&state, &token, EscalationOutcome::Confirmed, now);
            self.publish(&state);
            Ok(())
        } else {
            state.checkpoint.settle(id, EscalationOutcome::Rejected);
            self.deny(
                &mut state,
                vec![token.capability],
                &token.reason,
                ErrorKind::ChallengeRejected,
                format!(
                    "the response did not match the challenge for {}; {} was not granted",
                    token.capability, token.capability
                ),
            );
            self.settled(&state, &token, EscalationOutcome::Rejected, now);
            self.publish(&state);
            Err(Error::ChallengeRejected(id))
        }
    }

    /// Withdraw a pending checkpoint without granting anything.
    ///
    /// Carries no penalty: nothing is counted and later requests for the same
    /// capability are treated exactly like the first.
    pub fn dismiss_escalation(&self, id: TokenId) -> Result<()> {
        let token = self.take(id)?;
        let now = self.clock.now();
        {
            let mut state = self.lock();
            state.checkpoint.settle(id, EscalationOutcome::Dismissed);
            self.settled(&state, &token, EscalationOutcome::Dismissed, now);
            self.publish(&state);
        }
        self.bridge.discard(id);
        Ok(())
    }

    /// Settle every overdue pending token as expired. Returns how many.
    pub fn expire_pending(&self) -> usize {
        let now = self.clock.now();
        let expired = {
            let mut state = self.lock();
            let expired = state.checkpoint.expire_due(now);
            for token in &expired {
                self.record_expired(&mut state, token, now);
            }
            if !expired.is_empty() {
                self.publish(&state);
            }
            expired
        };
        for token in &expired {
            self.bridge.discard(token.id);
        }
        expired.len()
    }

    /// Remove every grant for `capability`. Returns how many were held.
    pub fn revoke(&self, capability: Capability) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.ensure_open(&state)?;
        let count = state.grants.revoke(capability);
        if count > 0 {
            state.write(
                self.session_id,
                EventKind::GrantRevoked { capability, count },
                now,
            );
            info!(session = %self.session_id, %capability, count, "grants revoked");
            self.publish(&state);
        }
        Ok(count)
    }

    /// Compare an observed process id against the bound identity.
    ///
    /// A mismatch halts the session permanently and records a denial.
    pub fn verify_identity(&self, observed_pid: u32) -> Result<()> {
        let now = self.clock.now();
        let (cancelled, message) = {
            let mut state = self.lock();
            self.ensure_open(&state)?;
            let Verification::Violation(violation) = self.identity.verify(observed_pid) else {
                return Ok(());
            };

            let message = violation.message();
            error!(
                session = %self.session_id,
                bound_pid = violation.bound_pid,
                observed_pid,
                "process identity mismatch, halting session"
            );
            let cancelled = self.halt(&mut state, &message, now);
            self.deny(
                &mut state,
                Vec::new(),
                "process identity verification",
                ErrorKind::IdentityMismatch,
                message.clone(),
            );
            self.publish(&state);
            (cancelled, message)
        };

        for token in &cancelled {
            self.bridge.discard(token.id);
        }
        Err(Error::IdentityMismatch(message))
    }

    /// Verify against the process making this call.
    pub fn verify_current_process(&self) -> Result<()> {
        self.verify_identity(std::process::id())
    }

    pub fn is_halted(&self) -> bool {
        self.lock().ledger.is_halted()
    }

    pub fn last_denial(&self) -> Option<DenialRecord> {
        self.lock().ledger.last().cloned()
    }

    /// Recent denials, oldest first.
    pub fn denial_history(&self) -> Vec<DenialRecord> {
        self.lock().ledger.history().cloned().collect()
    }

    /// Capabilities with a live grant. Diagnostic only.
    pub fn active_grants(&self) -> BTreeSet<Capability> {
        self.lock().grants.list_active()
    }

    pub fn escalation_state(&self, id: TokenId) -> Option<EscalationState> {
        self.lock().checkpoint.state(id)
    }

    pub fn pending_escalations(&self) -> Vec<ConfirmationToken> {
        self.lock().checkpoint.pending()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lock().snapshot(self.session_id, *self.identity.bound())
    }

    /// Receive a fresh snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Close the session: drop step-up grants and cancel pending checkpoints.
    pub(crate) fn end(&self) {
        let now = self.clock.now();
        let cancelled = {
            let mut state = self.lock();
            if state.ended_at.is_some() {
                return;
            }
            let cancelled = state.checkpoint.cancel_all();
            for token in &cancelled {
                self.settled(&state, token, EscalationOutcome::Dismissed, now);
            }
            let dropped = state.grants.drop_ephemeral();
            state.ended_at = Some(now);
            state.write(self.session_id, EventKind::SessionEnd, now);
            info!(session = %self.session_id, dropped, "capability session ended");
            self.publish(&state);
            cancelled
        };
        for token in &cancelled {
            self.bridge.discard(token.id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self, state: &State, capability: Capability) -> std::result::Result<(), Refusal> {
        if let Some(message) = state.closed() {
            return Err(Refusal::Closed(message));
        }
        if let Decision::Deny { reason } = self.policy.evaluate(capability) {
            return Err(Refusal::Denied(reason));
        }
        if state.grants.has_grant(capability) {
            Ok(())
        } else {
            Err(Refusal::Absent)
        }
    }

    fn ensure_open(&self, state: &State) -> Result<()> {
        match state.closed() {
            Some(message) => Err(Error::SessionHalted(message)),
            None => Ok(()),
        }
    }

    /// Take a pending token out for consumption, recording expiry.
    fn take(&self, id: TokenId) -> Result<ConfirmationToken> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.ensure_open(&state)?;
        match state.checkpoint.take(id, now) {
            Ok(token) => Ok(token),
            Err(Error::TokenExpired(id)) => {
                if let Some(token) = state.checkpoint.token(id).cloned() {
                    self.record_expired(&mut state, &token, now);
                    self.publish(&state);
                }
                drop(state);
                self.bridge.discard(id);
                Err(Error::TokenExpired(id))
            }
            Err(e) => Err(e),
        }
    }

    fn halt(&self, state: &mut State, message: &str, now: DateTime<Utc>) -> Vec<ConfirmationToken> {
        if !state.ledger.halt(message, now) {
            return Vec::new();
        }
        state.write(
            self.session_id,
            EventKind::Halted {
                message: message.to_string(),
            },
            now,
        );
        let cancelled = state.checkpoint.cancel_all();
        for token in &cancelled {
            self.settled(state, token, EscalationOutcome::Dismissed, now);
        }
        cancelled
    }

    fn deny(
        &self,
        state: &mut State,
        capabilities: Vec<Capability>,
        reason: &str,
        kind: ErrorKind,
        message: String,
    ) {
        let now = self.clock.now();
        warn!(
            session = %self.session_id,
            ?capabilities,
            reason,
            kind = %kind,
            message = %message,
            "request denied"
        );
        state.write(
            self.session_id,
            EventKind::Denied {
                capabilities: capabilities.clone(),
                reason: reason.to_string(),
                error_kind: kind.as_str().to_string(),
                message: message.clone(),
            },
            now,
        );
        state
            .ledger
            .record(DenialRecord::new(capabilities, reason, kind, message, now));
    }

    fn record_expired(&self, state: &mut State, token: &ConfirmationToken, now: DateTime<Utc>) {
        self.settled(state, token, EscalationOutcome::Expired, now);
        self.deny(
            state,
            vec![token.capability],
            &token.reason,
            ErrorKind::TokenExpired,
            format!(
                "the confirmation for {} expired at {} before a response was received",
                token.capability,
                token.expires_at.to_rfc3339()
            ),
        );
    }

    fn settled(
        &self,
        state: &State,
        token: &ConfirmationToken,
        outcome: EscalationOutcome,
        now: DateTime<Utc>,
    ) {
        info!(
            session = %self.session_id,
            token = %token.id,
            capability = %token.capability,
            outcome = outcome.as_str(),
            "consent checkpoint settled"
        );
        state.write(
            self.session_id,
            EventKind::EscalationSettled {
                token_id: token.id.0,
                capability: token.capability,
                outcome,
            },
            now,
        );
    }

    fn publish(&self, state: &State) {
        self.status
            .send_replace(state.snapshot(self.session_id, *self.identity.bound()));
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("session_id", &self.session_id)
            .field("identity", self.identity.bound())
            .finish_non_exhaustive()
    }
}
