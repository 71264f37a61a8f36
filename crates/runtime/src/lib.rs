//! Capability authority runtime for mixing sessions.
//!
//! This crate decides which privileged actions a session may perform,
//! runs step-up consent through Active Consent Checkpoints, and halts a
//! session for good when it detects that its process identity changed.
//!
//! # Overview
//!
//! - **Authority**: composes the grant store, identity guard, consent
//!   checkpoint and denial ledger behind one lock. `check` and
//!   `check_all_of` never block on a human and never return errors.
//! - **Checkpoint**: the per-request token state machine. Tokens are
//!   single-use; duplicate requests collapse onto the pending token.
//! - **ChallengeBridge**: produces challenge payloads and verifies responses.
//!   The authority never sees what a correct answer looks like.
//! - **ConsentChannel**: the async hand-off between a requester and the
//!   surface that collects the user's answer.
//! - **Session**: the explicitly owned aggregate with `init`/`teardown`.
//!
//! # Example
//!
//! ```no_run
//! use policy::{Capability, Policy};
//! use runtime::{Session, SessionConfig};
//!
//! # fn example() -> runtime::Result<()> {
//! let session = Session::init(SessionConfig::new(Policy::restrictive()))?;
//! let authority = session.authority();
//!
//! if !authority.check(Capability::RenderExport, "bounce final mix") {
//!     let token = authority.request_escalation(Capability::RenderExport, "bounce final mix")?;
//!     println!("{}", token.challenge_payload);
//!     // ... collect the user's answer, then:
//!     authority.confirm_escalation(token.id, "AB1CD2")?;
//! }
//! session.teardown();
//! # Ok(())
//! # }
//! ```

pub mod acc;
mod authority;
pub mod challenge;
pub mod clock;
pub mod consent;
mod error;
pub mod identity;
pub mod ledger;
mod session;

pub use acc::{ConfirmationToken, EscalationState, TokenId};
pub use authority::{Authority, AuthorityBuilder, DEFAULT_TOKEN_TTL, StatusSnapshot};
pub use challenge::{ChallengeBridge, ChallengeKind, HashedChallengeBridge};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consent::{ConsentChannel, ConsentDesk, ConsentPrompt, ConsentReply};
pub use error::{Error, ErrorKind, Result};
pub use identity::{IdentityGuard, ProcessIdentity};
pub use ledger::{DenialRecord, HaltRecord};
pub use session::{Session, SessionConfig};
pub use storage::EscalationOutcome;
