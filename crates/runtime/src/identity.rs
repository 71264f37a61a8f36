//! Process identity binding.
//!
//! A session is bound to the process that created it. Any later observation
//! of a different process id is a critical violation: the caller halts the
//! session and there is no retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The process a session is bound to. Captured once, never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub binding_established_at: DateTime<Utc>,
}

impl ProcessIdentity {
    pub fn new(pid: u32, binding_established_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            binding_established_at,
        }
    }

    /// Bind to the calling process.
    pub fn current(binding_established_at: DateTime<Utc>) -> Self {
        Self::new(std::process::id(), binding_established_at)
    }
}

/// Severity of a guard violation. Only critical violations are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
}

/// A failed identity verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub severity: Severity,
    pub bound_pid: u32,
    pub observed_pid: u32,
}

impl Violation {
    /// Literal description suitable for display as-is.
    pub fn message(&self) -> String {
        format!(
            "session is bound to process {} but was accessed from process {}; the session has been halted",
            self.bound_pid, self.observed_pid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Ok,
    Violation(Violation),
}

/// Compares observed process ids with the bound identity.
#[derive(Debug, Clone)]
pub struct IdentityGuard {
    bound: ProcessIdentity,
}

impl IdentityGuard {
    pub fn new(bound: ProcessIdentity) -> Self {
        Self { bound }
    }

    pub fn bound(&self) -> &ProcessIdentity {
        &self.bound
    }

    /// Exact match on the bound pid.
    pub fn verify(&self, observed_pid: u32) -> Verification {
        if observed_pid == self.bound.pid {
            Verification::Ok
        } else {
            Verification::Violation(Violation {
                severity: Severity::Critical,
                bound_pid: self.bound.pid,
                observed_pid,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_pid_verifies() {
        let guard = IdentityGuard::new(ProcessIdentity::new(100, Utc::now()));
        assert_eq!(guard.verify(100), Verification::Ok);
    }

    #[test]
    fn test_other_pid_is_critical() {
        let guard = IdentityGuard::new(ProcessIdentity::new(100, Utc::now()));
        let Verification::Violation(v) = guard.verify(101) else {
            panic!("expected violation");
        };
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.message().contains("bound to process 100"));
        assert!(v.message().contains("from process 101"));
    }

    #[test]
    fn test_current_uses_own_pid() {
        let identity = ProcessIdentity::current(Utc::now());
        assert_eq!(identity.pid, std::process::id());
    }
}
