//! Behavioural tests for the capability authority.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use policy::{Capability, Policy};
use proptest::prelude::*;
use runtime::{
    Authority, ChallengeBridge, Clock, EscalationOutcome, EscalationState, Error, ErrorKind,
    ManualClock, ProcessIdentity, TokenId,
};

const BOUND_PID: u32 = 4242;

/// Accepts the literal response "approve".
struct Approve;

impl ChallengeBridge for Approve {
    fn issue(&self, _token: TokenId, capability: Capability) -> String {
        format!("type approve to enable {capability}")
    }

    fn verify(&self, _token: TokenId, response: &str) -> bool {
        response == "approve"
    }
}

fn policy() -> Policy {
    Policy::parse(
        r#"
[grants]
standing = ["adjust_parameter", "apply_eq", "mix_track"]

[step_up]
required = ["render_export", "load_plugin"]

[deny]
all = ["edit_automation"]
"#,
    )
    .unwrap()
}

fn authority_with_clock(clock: Arc<ManualClock>) -> Authority {
    Authority::builder(policy())
        .identity(ProcessIdentity::new(BOUND_PID, clock.now()))
        .clock(clock)
        .bridge(Arc::new(Approve))
        .token_ttl(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn authority() -> Authority {
    authority_with_clock(Arc::new(ManualClock::default()))
}

#[test]
fn ungranted_capability_is_plain_false() {
    let authority = authority();
    assert!(!authority.check(Capability::ApplyReverb, "add space"));
    assert!(!authority.check(Capability::RenderExport, "bounce"));
    assert!(authority.last_denial().is_none());
}

#[test]
fn standing_grant_checks_true() {
    let authority = authority();
    assert!(authority.check(Capability::ApplyEq, "cut mud"));
    assert!(authority.requires_step_up(Capability::RenderExport));
    assert!(!authority.requires_step_up(Capability::ApplyEq));
}

#[test]
fn deny_policy_records_denial() {
    let authority = authority();
    assert!(!authority.check(Capability::EditAutomation, "draw fade"));

    let denial = authority.last_denial().unwrap();
    assert_eq!(denial.error.kind, ErrorKind::PolicyDenied);
    assert_eq!(denial.request.capabilities, vec![Capability::EditAutomation]);
    assert_eq!(denial.request.reason, "draw fade");
    assert_eq!(denial.error.message, "edit_automation is denied by policy");
}

#[test]
fn all_of_matches_individual_checks_and_records_once() {
    let authority = authority();
    assert!(authority.check_all_of(&[Capability::ApplyEq, Capability::MixTrack], "balance"));
    assert!(authority.denial_history().is_empty());

    assert!(!authority.check_all_of(
        &[Capability::ApplyEq, Capability::ApplyReverb, Capability::RenderExport],
        "print stems",
    ));
    let history = authority.denial_history();
    assert_eq!(history.len(), 1);
    let denial = &history[0];
    assert_eq!(denial.error.kind, ErrorKind::CapabilityAbsent);
    assert_eq!(denial.request.capabilities.len(), 3);
    assert!(denial.error.message.starts_with("apply_reverb is not granted"));
}

#[test]
fn escalation_round_trip_grants_once() {
    let authority = authority();
    let token = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    assert!(!authority.check(Capability::RenderExport, "bounce"));

    authority.confirm_escalation(token.id, "approve").unwrap();
    assert!(authority.check(Capability::RenderExport, "bounce"));
    assert_eq!(
        authority.escalation_state(token.id),
        Some(EscalationState::Settled(EscalationOutcome::Confirmed))
    );

    let again = authority.confirm_escalation(token.id, "approve");
    assert!(matches!(again, Err(Error::TokenConsumed(id)) if id == token.id));
    let dismiss = authority.dismiss_escalation(token.id);
    assert!(matches!(dismiss, Err(Error::TokenConsumed(_))));
}

#[test]
fn duplicate_request_collapses_onto_pending_token() {
    let authority = authority();
    let first = authority
        .request_escalation(Capability::LoadPlugin, "open rack")
        .unwrap();

    let err = authority
        .request_escalation(Capability::LoadPlugin, "open rack")
        .unwrap_err();
    let Error::AlreadyPending(existing) = err else {
        panic!("expected AlreadyPending, got {err:?}");
    };
    assert_eq!(existing.id, first.id);
    assert_eq!(authority.pending_escalations().len(), 1);
}

#[test]
fn rejected_response_consumes_token() {
    let authority = authority();
    let token = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();

    let err = authority.confirm_escalation(token.id, "ok").unwrap_err();
    assert!(matches!(err, Error::ChallengeRejected(_)));
    assert!(!authority.check(Capability::RenderExport, "bounce"));
    assert_eq!(
        authority.last_denial().unwrap().error.kind,
        ErrorKind::ChallengeRejected
    );
    assert!(matches!(
        authority.confirm_escalation(token.id, "approve"),
        Err(Error::TokenConsumed(_))
    ));

    // A fresh request is allowed right away.
    let retry = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    authority.confirm_escalation(retry.id, "approve").unwrap();
    assert!(authority.check(Capability::RenderExport, "bounce"));
}

#[test]
fn repeated_dismissal_never_locks_out() {
    let authority = authority();
    let before = authority.active_grants();

    for _ in 0..25 {
        let token = authority
            .request_escalation(Capability::LoadPlugin, "open rack")
            .unwrap();
        authority.dismiss_escalation(token.id).unwrap();
        assert_eq!(authority.active_grants(), before);
    }
    assert!(authority.denial_history().is_empty());

    let token = authority
        .request_escalation(Capability::LoadPlugin, "open rack")
        .unwrap();
    authority.confirm_escalation(token.id, "approve").unwrap();
    assert!(authority.check(Capability::LoadPlugin, "open rack"));
}

#[test]
fn expired_token_is_recorded_distinctly() {
    let clock = Arc::new(ManualClock::default());
    let authority = authority_with_clock(Arc::clone(&clock));
    let token = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    assert_eq!(token.expires_at - token.issued_at, chrono::Duration::seconds(60));

    clock.advance(chrono::Duration::seconds(61));
    let err = authority.confirm_escalation(token.id, "approve").unwrap_err();
    assert!(matches!(err, Error::TokenExpired(_)));
    assert_eq!(
        authority.escalation_state(token.id),
        Some(EscalationState::Settled(EscalationOutcome::Expired))
    );
    assert_eq!(authority.last_denial().unwrap().error.kind, ErrorKind::TokenExpired);
    assert!(!authority.check(Capability::RenderExport, "bounce"));
    assert!(matches!(
        authority.confirm_escalation(token.id, "approve"),
        Err(Error::TokenConsumed(_))
    ));
}

#[test]
fn expire_pending_sweeps_overdue_tokens() {
    let clock = Arc::new(ManualClock::default());
    let authority = authority_with_clock(Arc::clone(&clock));
    authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    clock.advance(chrono::Duration::seconds(30));
    let late = authority
        .request_escalation(Capability::LoadPlugin, "open rack")
        .unwrap();

    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(authority.expire_pending(), 1);
    let pending = authority.pending_escalations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, late.id);
}

#[test]
fn lapsed_request_can_be_reissued() {
    let clock = Arc::new(ManualClock::default());
    let authority = authority_with_clock(Arc::clone(&clock));
    let first = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();

    clock.advance(chrono::Duration::seconds(120));
    let second = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(
        authority.escalation_state(first.id),
        Some(EscalationState::Settled(EscalationOutcome::Expired))
    );
}

#[test]
fn denied_capability_cannot_be_escalated() {
    let authority = authority();
    let err = authority
        .request_escalation(Capability::EditAutomation, "draw fade")
        .unwrap_err();
    assert!(matches!(err, Error::PolicyDenied(_)));
    assert!(authority.pending_escalations().is_empty());
}

#[test]
fn only_step_up_capabilities_escalate() {
    let authority = authority();
    let err = authority
        .request_escalation(Capability::ApplyReverb, "add space")
        .unwrap_err();
    assert!(matches!(err, Error::PolicyDenied(_)));
    assert!(authority.pending_escalations().is_empty());
    assert!(authority.last_denial().is_none());
    assert!(!authority.check(Capability::ApplyReverb, "add space"));
}

#[test]
fn unknown_token_is_reported() {
    let authority = authority();
    let id = TokenId::new();
    assert!(matches!(
        authority.confirm_escalation(id, "approve"),
        Err(Error::UnknownToken(_))
    ));
}

#[test]
fn revoke_removes_grant() {
    let authority = authority();
    assert_eq!(authority.revoke(Capability::ApplyEq).unwrap(), 1);
    assert!(!authority.check(Capability::ApplyEq, "cut mud"));
    assert_eq!(authority.revoke(Capability::ApplyEq).unwrap(), 0);
}

#[test]
fn identity_mismatch_halts_exactly_once() {
    let authority = authority();
    let mut status = authority.subscribe();
    let token = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();

    authority.verify_identity(BOUND_PID).unwrap();
    assert!(!authority.is_halted());

    let err = authority.verify_identity(BOUND_PID + 1).unwrap_err();
    assert!(matches!(err, Error::IdentityMismatch(_)));
    assert!(err.is_fatal());
    assert!(authority.is_halted());

    let denial = authority.last_denial().unwrap();
    assert_eq!(denial.error.kind, ErrorKind::IdentityMismatch);
    assert!(denial.error.message.contains(&format!("bound to process {BOUND_PID}")));

    // Later verifications report the halt instead of halting again.
    assert!(matches!(
        authority.verify_identity(BOUND_PID + 1),
        Err(Error::SessionHalted(_))
    ));
    assert!(matches!(
        authority.verify_identity(BOUND_PID),
        Err(Error::SessionHalted(_))
    ));
    assert_eq!(
        authority
            .denial_history()
            .iter()
            .filter(|d| d.error.kind == ErrorKind::IdentityMismatch)
            .count(),
        1
    );

    // Pending checkpoint was cancelled by the halt.
    assert_eq!(
        authority.escalation_state(token.id),
        Some(EscalationState::Settled(EscalationOutcome::Dismissed))
    );
    assert!(status.has_changed().unwrap());
    assert!(status.borrow_and_update().is_halted);
}

#[test]
fn halted_session_denies_everything() {
    let authority = authority();
    assert!(authority.check(Capability::ApplyEq, "cut mud"));
    let _ = authority.verify_identity(BOUND_PID + 7);

    for capability in Capability::ALL {
        assert!(!authority.check(capability, "after halt"));
    }
    assert_eq!(
        authority.last_denial().unwrap().error.kind,
        ErrorKind::SessionHalted
    );
    assert!(!authority.check_all_of(&[], "nothing"));
    assert!(matches!(
        authority.request_escalation(Capability::RenderExport, "bounce"),
        Err(Error::SessionHalted(_))
    ));
    assert!(matches!(authority.revoke(Capability::ApplyEq), Err(Error::SessionHalted(_))));
    // Grants predating the halt are still held, just not honored.
    assert!(authority.active_grants().contains(&Capability::ApplyEq));
}

#[test]
fn confirm_after_halt_fails() {
    let authority = authority();
    let token = authority
        .request_escalation(Capability::RenderExport, "bounce")
        .unwrap();
    let _ = authority.verify_identity(BOUND_PID + 1);

    assert!(matches!(
        authority.confirm_escalation(token.id, "approve"),
        Err(Error::SessionHalted(_))
    ));
    assert!(!authority.active_grants().contains(&Capability::RenderExport));
}

#[test]
fn concurrent_confirms_succeed_exactly_once() {
    for _ in 0..20 {
        let authority = Arc::new(authority());
        let id = authority
            .request_escalation(Capability::RenderExport, "bounce")
            .unwrap()
            .id;
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let authority = Arc::clone(&authority);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    authority.confirm_escalation(id, "approve")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::TokenConsumed(_))));

        let status = authority.status();
        assert!(status.active_grants.contains(&Capability::RenderExport));
        assert_eq!(
            authority.revoke(Capability::RenderExport).unwrap(),
            1,
            "exactly one ephemeral grant"
        );
    }
}

#[test]
fn halt_is_visible_to_concurrent_checkers() {
    let authority = Arc::new(authority());
    authority.verify_identity(BOUND_PID + 1).unwrap_err();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let authority = Arc::clone(&authority);
            thread::spawn(move || authority.check(Capability::ApplyEq, "cut mud"))
        })
        .collect();
    for handle in handles {
        assert!(!handle.join().unwrap());
    }
}

#[test]
fn status_snapshot_serializes_for_displays() {
    let authority = authority();
    authority.check(Capability::EditAutomation, "draw fade");
    let json = serde_json::to_value(authority.status()).unwrap();

    assert_eq!(json["is_halted"], false);
    assert_eq!(json["process_identity"]["pid"], BOUND_PID);
    assert_eq!(json["last_denial"]["error"]["kind"], "policy_denied");
    assert!(json["active_grants"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("apply_eq")));
}

fn any_capabilities() -> impl Strategy<Value = Vec<Capability>> {
    prop::collection::vec(prop::sample::select(Capability::ALL.to_vec()), 0..6)
}

proptest! {
    #[test]
    fn all_of_is_conjunction_of_checks(caps in any_capabilities()) {
        let authority = authority();
        let expected = caps.iter().all(|&c| authority.check(c, "probe"));
        let before = authority.denial_history().len();

        let got = authority.check_all_of(&caps, "probe all");
        prop_assert_eq!(got, expected);

        let recorded = authority.denial_history().len() - before;
        prop_assert_eq!(recorded, usize::from(!got));
    }

    #[test]
    fn halted_denies_any_capability(caps in any_capabilities()) {
        let authority = authority();
        let _ = authority.verify_identity(BOUND_PID + 1);
        for cap in &caps {
            prop_assert!(!authority.check(*cap, "probe"));
        }
        prop_assert!(!authority.check_all_of(&caps, "probe all"));
    }
}
