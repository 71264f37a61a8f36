//! Active Consent Checkpoint: the per-request token state machine.
//!
//! ```text
//! NoRequest -> Pending(token) -> Confirmed | Dismissed | Expired | Rejected
//! ```
//!
//! Terminal states are final for their token. A new request for the same
//! capability and reason starts a fresh cycle with a new token. At most one
//! token is pending per request key.

use chrono::{DateTime, Utc};
use policy::Capability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use storage::EscalationOutcome;
use uuid::Uuid;

use crate::{Error, Result};

/// Identifier of a confirmation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-use artifact representing one pending consent challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationToken {
    pub id: TokenId,
    pub capability: Capability,
    pub reason: String,
    pub challenge_payload: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConfirmationToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn key(&self) -> EscalationKey {
        EscalationKey {
            capability: self.capability,
            reason: self.reason.clone(),
        }
    }
}

/// Where a token is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Pending,
    Settled(EscalationOutcome),
}

/// Two requests are equivalent when capability and reason match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EscalationKey {
    capability: Capability,
    reason: String,
}

#[derive(Debug)]
struct Entry {
    token: ConfirmationToken,
    state: EscalationState,
}

/// Token bookkeeping for every escalation request in a session.
///
/// Not synchronized; the authority applies every call under its lock.
#[derive(Debug, Default)]
pub struct Checkpoint {
    tokens: HashMap<TokenId, Entry>,
    pending: HashMap<EscalationKey, TokenId>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live pending token for a request, if one exists and has not lapsed.
    pub fn pending_for(
        &self,
        capability: Capability,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<&ConfirmationToken> {
        let key = EscalationKey {
            capability,
            reason: reason.to_string(),
        };
        let id = self.pending.get(&key)?;
        self.tokens
            .get(id)
            .map(|entry| &entry.token)
            .filter(|token| !token.is_expired(now))
    }

    /// Register a freshly issued token as the pending one for its request.
    ///
    /// Fails with `AlreadyPending` if a live token exists for the request.
    /// A lapsed predecessor is moved to `Expired` and returned so the caller
    /// can record it.
    pub fn open(&mut self, token: ConfirmationToken) -> Result<Option<ConfirmationToken>> {
        let key = token.key();
        let mut lapsed = None;

        if let Some(existing) = self.pending.get(&key).copied() {
            let live = self
                .tokens
                .get(&existing)
                .filter(|entry| !entry.token.is_expired(token.issued_at))
                .map(|entry| entry.token.clone());
            if let Some(live) = live {
                return Err(Error::AlreadyPending(Box::new(live)));
            }
            lapsed = self.settle(existing, EscalationOutcome::Expired);
        }

        self.pending.insert(key, token.id);
        self.tokens.insert(
            token.id,
            Entry {
                token,
                state: EscalationState::Pending,
            },
        );
        Ok(lapsed)
    }

    /// Take a pending token for consumption.
    ///
    /// On success the token is no longer pending for its request; the caller
    /// must settle it. An overdue token is settled as `Expired` and reported
    /// as `TokenExpired`.
    pub fn take(&mut self, id: TokenId, now: DateTime<Utc>) -> Result<ConfirmationToken> {
        let entry = self.tokens.get(&id).ok_or(Error::UnknownToken(id))?;
        if entry.state != EscalationState::Pending {
            return Err(Error::TokenConsumed(id));
        }
        let token = entry.token.clone();
        let key = token.key();
        if self.pending.get(&key) != Some(&id) {
            return Err(Error::TokenConsumed(id));
        }
        if token.is_expired(now) {
            self.settle(id, EscalationOutcome::Expired);
            return Err(Error::TokenExpired(id));
        }

        self.pending.remove(&key);
        Ok(token)
    }

    /// Move a token to a terminal state. Returns the token if it was pending
    /// or in flight; settling an already settled token does nothing.
    pub fn settle(&mut self, id: TokenId, outcome: EscalationOutcome) -> Option<ConfirmationToken> {
        let entry = self.tokens.get_mut(&id)?;
        if entry.state != EscalationState::Pending {
            return None;
        }
        entry.state = EscalationState::Settled(outcome);
        let key = entry.token.key();
        if self.pending.get(&key) == Some(&id) {
            self.pending.remove(&key);
        }
        Some(entry.token.clone())
    }

    /// Settle every pending token that has passed its expiry.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<ConfirmationToken> {
        let due: Vec<TokenId> = self
            .pending
            .values()
            .copied()
            .filter(|id| {
                self.tokens
                    .get(id)
                    .is_some_and(|entry| entry.token.is_expired(now))
            })
            .collect();
        due.into_iter()
            .filter_map(|id| self.settle(id, EscalationOutcome::Expired))
            .collect()
    }

    /// Settle every pending token as dismissed.
    pub fn cancel_all(&mut self) -> Vec<ConfirmationToken> {
        let ids: Vec<TokenId> = self.pending.values().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.settle(id, EscalationOutcome::Dismissed))
            .collect()
    }

    pub fn token(&self, id: TokenId) -> Option<&ConfirmationToken> {
        self.tokens.get(&id).map(|entry| &entry.token)
    }

    pub fn state(&self, id: TokenId) -> Option<EscalationState> {
        self.tokens.get(&id).map(|entry| entry.state)
    }

    /// Tokens currently pending, in issue order.
    pub fn pending(&self) -> Vec<ConfirmationToken> {
        let mut tokens: Vec<_> = self
            .pending
            .values()
            .filter_map(|id| self.tokens.get(id))
            .map(|entry| entry.token.clone())
            .collect();
        tokens.sort_by_key(|token| token.issued_at);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(capability: Capability, reason: &str, now: DateTime<Utc>) -> ConfirmationToken {
        ConfirmationToken {
            id: TokenId::new(),
            capability,
            reason: reason.to_string(),
            challenge_payload: "Type this code to continue: AB1CD2".into(),
            issued_at: now,
            expires_at: now + Duration::seconds(300),
        }
    }

    #[test]
    fn test_duplicate_request_reports_existing_token() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let first = token(Capability::RenderExport, "bounce", now);
        acc.open(first.clone()).unwrap();

        let err = acc
            .open(token(Capability::RenderExport, "bounce", now))
            .unwrap_err();
        let Error::AlreadyPending(existing) = err else {
            panic!("expected AlreadyPending");
        };
        assert_eq!(existing.id, first.id);
        assert_eq!(acc.pending().len(), 1);
    }

    #[test]
    fn test_different_reason_is_a_different_request() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        acc.open(token(Capability::RenderExport, "bounce", now)).unwrap();
        acc.open(token(Capability::RenderExport, "stems", now)).unwrap();
        assert_eq!(acc.pending().len(), 2);
    }

    #[test]
    fn test_take_is_exactly_once() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let t = token(Capability::LoadPlugin, "rack", now);
        acc.open(t.clone()).unwrap();

        assert_eq!(acc.take(t.id, now).unwrap().id, t.id);
        acc.settle(t.id, EscalationOutcome::Confirmed);
        assert!(matches!(acc.take(t.id, now), Err(Error::TokenConsumed(_))));
        assert_eq!(
            acc.state(t.id),
            Some(EscalationState::Settled(EscalationOutcome::Confirmed))
        );
    }

    #[test]
    fn test_take_in_flight_token_is_consumed() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let t = token(Capability::LoadPlugin, "rack", now);
        acc.open(t.clone()).unwrap();

        acc.take(t.id, now).unwrap();
        assert!(matches!(acc.take(t.id, now), Err(Error::TokenConsumed(_))));
    }

    #[test]
    fn test_take_overdue_token_expires_it() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let t = token(Capability::RenderExport, "bounce", now);
        acc.open(t.clone()).unwrap();

        let later = now + Duration::seconds(301);
        assert!(matches!(acc.take(t.id, later), Err(Error::TokenExpired(_))));
        assert_eq!(
            acc.state(t.id),
            Some(EscalationState::Settled(EscalationOutcome::Expired))
        );
        assert!(matches!(acc.take(t.id, later), Err(Error::TokenConsumed(_))));
    }

    #[test]
    fn test_open_replaces_lapsed_token() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let old = token(Capability::RenderExport, "bounce", now);
        acc.open(old.clone()).unwrap();

        let later = now + Duration::seconds(400);
        let lapsed = acc
            .open(token(Capability::RenderExport, "bounce", later))
            .unwrap();
        assert_eq!(lapsed.map(|t| t.id), Some(old.id));
        assert_eq!(acc.pending().len(), 1);
    }

    #[test]
    fn test_unknown_token() {
        let mut acc = Checkpoint::new();
        let id = TokenId::new();
        assert!(matches!(acc.take(id, Utc::now()), Err(Error::UnknownToken(_))));
    }

    #[test]
    fn test_cancel_all_dismisses_pending() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let a = token(Capability::RenderExport, "bounce", now);
        let b = token(Capability::LoadPlugin, "rack", now);
        acc.open(a.clone()).unwrap();
        acc.open(b.clone()).unwrap();

        assert_eq!(acc.cancel_all().len(), 2);
        assert!(acc.pending().is_empty());
        assert_eq!(
            acc.state(a.id),
            Some(EscalationState::Settled(EscalationOutcome::Dismissed))
        );
    }

    #[test]
    fn test_expire_due_only_touches_overdue() {
        let now = Utc::now();
        let mut acc = Checkpoint::new();
        let early = token(Capability::RenderExport, "bounce", now);
        let late = token(Capability::LoadPlugin, "rack", now + Duration::seconds(200));
        acc.open(early.clone()).unwrap();
        acc.open(late.clone()).unwrap();

        let expired = acc.expire_due(now + Duration::seconds(350));
        assert_eq!(expired.iter().map(|t| t.id).collect::<Vec<_>>(), vec![early.id]);
        assert_eq!(acc.state(late.id), Some(EscalationState::Pending));
    }
}
