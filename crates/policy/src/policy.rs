//! Policy configuration and evaluation.

use crate::{Capability, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Policy configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Capabilities granted when a session starts.
    #[serde(default)]
    pub grants: GrantRules,

    /// Capabilities that can only be obtained through a consent checkpoint.
    #[serde(default)]
    pub step_up: StepUpRules,

    /// Capabilities that are explicitly denied (overrides grants).
    #[serde(default)]
    pub deny: DenyRules,
}

/// Standing grants issued at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRules {
    #[serde(default)]
    pub standing: BTreeSet<Capability>,
}

/// Capabilities requiring step-up consent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpRules {
    #[serde(default)]
    pub required: BTreeSet<Capability>,
}

/// Rules for denied capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRules {
    /// Deny these capabilities outright, whatever grants are held.
    #[serde(default)]
    pub all: BTreeSet<Capability>,
}

/// What the policy says about a capability, independent of held grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Held grants decide; a consent checkpoint cannot grant it.
    Grantable,
    /// Only a confirmed consent checkpoint can grant it.
    StepUp,
    Deny { reason: String },
}

impl Policy {
    /// Load policy from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse and validate policy from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let policy: Policy = toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Default policy: routine mixing actions are granted, plugin loading and
    /// export need step-up consent.
    pub fn restrictive() -> Self {
        Self {
            grants: GrantRules {
                standing: BTreeSet::from([
                    Capability::AdjustParameter,
                    Capability::ApplyEq,
                    Capability::ApplyCompression,
                    Capability::MixTrack,
                ]),
            },
            step_up: StepUpRules {
                required: BTreeSet::from([Capability::LoadPlugin, Capability::RenderExport]),
            },
            deny: DenyRules::default(),
        }
    }

    /// Reject configurations that contradict themselves.
    pub fn validate(&self) -> Result<()> {
        if let Some(cap) = self.grants.standing.intersection(&self.deny.all).next() {
            return Err(Error::Invalid(format!(
                "{cap} is both a standing grant and denied"
            )));
        }
        if let Some(cap) = self.grants.standing.intersection(&self.step_up.required).next() {
            return Err(Error::Invalid(format!(
                "{cap} is both a standing grant and requires step-up"
            )));
        }
        Ok(())
    }

    /// Evaluate a capability against the policy.
    pub fn evaluate(&self, capability: Capability) -> Decision {
        // Check explicit denials first
        if self.deny.all.contains(&capability) {
            return Decision::Deny {
                reason: format!("{capability} is denied by policy"),
            };
        }
        if self.step_up.required.contains(&capability) {
            return Decision::StepUp;
        }
        Decision::Grantable
    }

    pub fn requires_step_up(&self, capability: Capability) -> bool {
        self.evaluate(capability) == Decision::StepUp
    }

    pub fn standing_grants(&self) -> impl Iterator<Item = Capability> + '_ {
        self.grants.standing.iter().copied()
    }
}
