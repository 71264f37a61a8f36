//! Grants and the per-session grant store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::Capability;

/// How long a grant lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    /// Issued at session start from policy; lives until revoked.
    #[default]
    Standing,
    /// Issued by a confirmed step-up; dropped when the session ends.
    Ephemeral,
}

/// A fact recording that a capability is authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub capability: Capability,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: GrantScope,
}

impl Grant {
    pub fn standing(capability: Capability, issued_at: DateTime<Utc>) -> Self {
        Self {
            capability,
            issued_at,
            scope: GrantScope::Standing,
        }
    }

    pub fn ephemeral(capability: Capability, issued_at: DateTime<Utc>) -> Self {
        Self {
            capability,
            issued_at,
            scope: GrantScope::Ephemeral,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.scope == GrantScope::Ephemeral
    }
}

/// The set of grants live for one session.
///
/// Mutation is append or remove only. A capability is authorized iff at least
/// one grant for it is held.
#[derive(Debug, Clone, Default)]
pub struct GrantStore {
    grants: HashMap<Capability, Vec<Grant>>,
}

impl GrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_grant(&self, capability: Capability) -> bool {
        self.grants
            .get(&capability)
            .is_some_and(|grants| !grants.is_empty())
    }

    pub fn add_grant(&mut self, grant: Grant) {
        self.grants.entry(grant.capability).or_default().push(grant);
    }

    /// Remove every grant for `capability`, returning how many were held.
    pub fn revoke(&mut self, capability: Capability) -> usize {
        self.grants
            .remove(&capability)
            .map(|grants| grants.len())
            .unwrap_or(0)
    }

    /// Drop step-up grants at session end, returning how many were removed.
    pub fn drop_ephemeral(&mut self) -> usize {
        let mut dropped = 0;
        self.grants.retain(|_, grants| {
            let before = grants.len();
            grants.retain(|g| !g.is_ephemeral());
            dropped += before - grants.len();
            !grants.is_empty()
        });
        dropped
    }

    /// Capabilities with at least one live grant.
    ///
    /// Diagnostic only; enforcement goes through [`GrantStore::has_grant`].
    pub fn list_active(&self) -> BTreeSet<Capability> {
        self.grants
            .iter()
            .filter(|(_, grants)| !grants.is_empty())
            .map(|(cap, _)| *cap)
            .collect()
    }

    /// Total number of grants held, counting duplicates.
    pub fn len(&self) -> usize {
        self.grants.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
