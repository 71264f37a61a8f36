//! Hand-off between code that needs a step-up and the surface that asks the
//! user.
//!
//! The authority itself never waits. [`ConsentChannel::escalate`] opens a
//! checkpoint, passes the token to whichever task owns the [`ConsentDesk`],
//! and awaits the user's reply. There are no timers and no retries: a token
//! that lapses while the user is deciding fails with `TokenExpired` when the
//! reply arrives, and a dropped prompt counts as a dismissal.

use policy::Capability;
use storage::EscalationOutcome;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::acc::ConfirmationToken;
use crate::{Authority, Result};

/// The user's answer to a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentReply {
    Respond(String),
    Dismiss,
}

/// One challenge waiting on the consent surface.
#[derive(Debug)]
pub struct ConsentPrompt {
    pub token: ConfirmationToken,
    responder: oneshot::Sender<ConsentReply>,
}

impl ConsentPrompt {
    pub fn respond(self, response: impl Into<String>) {
        self.reply(ConsentReply::Respond(response.into()));
    }

    /// Dismissal is always available and never penalized.
    pub fn dismiss(self) {
        self.reply(ConsentReply::Dismiss);
    }

    pub fn reply(self, reply: ConsentReply) {
        if self.responder.send(reply).is_err() {
            debug!(token = %self.token.id, "requester stopped waiting for consent");
        }
    }
}

/// Requester side.
#[derive(Debug, Clone)]
pub struct ConsentChannel {
    tx: mpsc::Sender<ConsentPrompt>,
}

/// Surface side.
#[derive(Debug)]
pub struct ConsentDesk {
    rx: mpsc::Receiver<ConsentPrompt>,
}

/// Create a linked channel and desk holding up to `capacity` unanswered prompts.
pub fn channel(capacity: usize) -> (ConsentChannel, ConsentDesk) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConsentChannel { tx }, ConsentDesk { rx })
}

impl ConsentDesk {
    /// Wait for the next prompt. `None` once every channel is dropped.
    pub async fn next(&mut self) -> Option<ConsentPrompt> {
        self.rx.recv().await
    }
}

impl ConsentChannel {
    /// Run one checkpoint to completion.
    ///
    /// Returns `Confirmed` when the capability was granted and `Dismissed`
    /// when the user (or a missing surface) declined. Rejected, expired and
    /// halted outcomes surface as errors from the authority.
    pub async fn escalate(
        &self,
        authority: &Authority,
        capability: Capability,
        reason: &str,
    ) -> Result<EscalationOutcome> {
        let token = authority.request_escalation(capability, reason)?;
        let id = token.id;
        let (responder, reply) = oneshot::channel();

        if self.tx.send(ConsentPrompt { token, responder }).await.is_err() {
            warn!(token = %id, %capability, "no consent surface attached, dismissing");
            authority.dismiss_escalation(id)?;
            return Ok(EscalationOutcome::Dismissed);
        }

        match reply.await {
            Ok(ConsentReply::Respond(response)) => {
                authority.confirm_escalation(id, &response)?;
                Ok(EscalationOutcome::Confirmed)
            }
            Ok(ConsentReply::Dismiss) | Err(_) => {
                authority.dismiss_escalation(id)?;
                Ok(EscalationOutcome::Dismissed)
            }
        }
    }
}
