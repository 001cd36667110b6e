//! Core types and traits for Covenant
//!
//! This crate defines the foundational types used throughout the system:
//! - TransactionId / ManagerId: identity of transactions and their manager
//! - Phase: ACTIVE → VOTING → {COMMITTED | ABORTED}
//! - Vote / PrepareCommitOutcome: participant replies
//! - Timestamp / Clock: time source for lease accounting
//! - LeaseDuration / Expiration / LeasePolicy: lease grant rules
//! - Participant: the two-phase-commit verbs a joined party implements
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lease;
pub mod participant;
pub mod timestamp;
pub mod types;

pub use error::{AbortCause, ParticipantError, Result, TxnError};
pub use lease::{Expiration, LeaseDuration, LeasePolicy};
pub use participant::{Participant, ParticipantRef};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};
pub use types::{ManagerId, Outcome, Phase, PrepareCommitOutcome, TransactionId, Vote};
