//! SQLite-backed audit log for capability sessions.
//!
//! This crate provides persistent storage for the authority's audit trail:
//! every grant, revocation, non-routine denial, consent checkpoint and halt
//! is captured and queryable after the session is gone.
//!
//! Grants themselves are never persisted. A session's authorization state
//! lives and dies with the session; only the record of what happened is kept.
//!
//! # Core Concepts
//!
//! ## EventStore
//!
//! The [`EventStore`] wraps a SQLite database and provides methods to append
//! events and query session history.
//!
//! ## Event
//!
//! An [`Event`] has a unique ID, the [`SessionId`] it belongs to, a timestamp
//! taken from the session clock, and an [`EventKind`].
//!
//! # Example
//!
//! ```no_run
//! use policy::Capability;
//! use storage::{Event, EventKind, EventStore, SessionId};
//!
//! let store = EventStore::open("audit.db")?;
//! let session_id = SessionId::new();
//! store.append(&Event::new(session_id, EventKind::SessionStart { pid: 4242 }))?;
//! store.append(&Event::new(
//!     session_id,
//!     EventKind::GrantAdded { capability: Capability::ApplyEq, ephemeral: false },
//! ))?;
//!
//! for event in store.load_session(session_id)? {
//!     println!("{}: {:?}", event.timestamp, event.kind);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{EscalationOutcome, Event, EventKind, SessionId};
pub use store::{EventStore, SessionSummary};
