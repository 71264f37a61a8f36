//! Capability-based policy system for mixing sessions.
//!
//! Core principle: **every privileged action requires a held grant.**
//!
//! The crate defines the closed [`Capability`] set, the per-session
//! [`GrantStore`], and the TOML-backed [`Policy`] that decides which
//! capabilities are granted at start, which need step-up consent, and which
//! are denied outright.

mod capability;
mod error;
mod grant;
mod policy;

pub use capability::Capability;
pub use error::{Error, Result};
pub use grant::{Grant, GrantScope, GrantStore};
pub use policy::{Decision, DenyRules, GrantRules, Policy, StepUpRules};
