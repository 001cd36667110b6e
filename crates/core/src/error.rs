//! Error types for Covenant
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - State errors (`CannotJoin`, `CannotAbort`, `NotModifiable`): the record is
//!   in a phase the operation does not accept. Never retried.
//! - Vote rejection (`CannotCommit`): the decision is ABORTED; the cause says
//!   which participant declined or failed, when there was one.
//! - Lease errors (`UnknownLease`): the lease was cancelled, expired, or its
//!   transaction already settled.
//! - Participant failures (`ParticipantError`): what a participant call
//!   returned. Communication failures say nothing authoritative about the
//!   participant's state; protocol failures are authoritative rejections.

use crate::types::{Outcome, Phase, TransactionId};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Covenant operations
pub type Result<T> = std::result::Result<T, TxnError>;

/// Failure returned by a participant call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    /// The call did not reach the participant or its reply was lost
    #[error("communication failure: {0}")]
    Communication(String),

    /// The participant understood the call and refused it
    #[error("transaction protocol failure: {0}")]
    Protocol(String),
}

impl ParticipantError {
    /// Construct a communication failure
    pub fn communication(message: impl Into<String>) -> Self {
        ParticipantError::Communication(message.into())
    }

    /// Construct a protocol failure
    pub fn protocol(message: impl Into<String>) -> Self {
        ParticipantError::Protocol(message.into())
    }

    /// Whether this is a communication failure
    pub fn is_communication(&self) -> bool {
        matches!(self, ParticipantError::Communication(_))
    }

    /// Whether this is a protocol failure
    pub fn is_protocol(&self) -> bool {
        matches!(self, ParticipantError::Protocol(_))
    }
}

/// Why a transaction was aborted
///
/// Participant positions are indices in join order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// A participant voted to abort
    VotedAbort {
        /// Position of the participant
        participant: usize,
    },
    /// A participant's prepare call failed
    PrepareFailed {
        /// Position of the participant
        participant: usize,
        /// What the call returned
        error: ParticipantError,
    },
    /// `abort` was requested
    Requested,
    /// The lease was cancelled before a decision was reached
    LeaseCancelled,
    /// The lease expired before a decision was reached
    LeaseExpired,
    /// The committing thread unwound before a decision was reached
    Interrupted,
}

impl AbortCause {
    /// Participant failure behind this cause, if any
    pub fn participant_error(&self) -> Option<&ParticipantError> {
        match self {
            AbortCause::PrepareFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Position of the participant that caused the abort, if any
    pub fn participant(&self) -> Option<usize> {
        match self {
            AbortCause::VotedAbort { participant } | AbortCause::PrepareFailed { participant, .. } => {
                Some(*participant)
            }
            _ => None,
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::VotedAbort { participant } => {
                write!(f, "participant #{} voted to abort", participant)
            }
            AbortCause::PrepareFailed { participant, error } => {
                write!(f, "participant #{} failed to prepare: {}", participant, error)
            }
            AbortCause::Requested => f.write_str("transaction was aborted"),
            AbortCause::LeaseCancelled => f.write_str("transaction lease was cancelled"),
            AbortCause::LeaseExpired => f.write_str("transaction lease expired"),
            AbortCause::Interrupted => f.write_str("commit was interrupted before a decision"),
        }
    }
}

/// Error types for transaction management
#[derive(Debug, Error)]
pub enum TxnError {
    /// No record for this id (never created, or already evicted)
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    /// Join attempted after the record left ACTIVE
    #[error("cannot join {id}: transaction is {phase}")]
    CannotJoin {
        /// Transaction
        id: TransactionId,
        /// Phase observed
        phase: Phase,
    },

    /// The decision is ABORTED
    #[error("cannot commit {id}: {cause}")]
    CannotCommit {
        /// Transaction
        id: TransactionId,
        /// Why it aborted
        cause: AbortCause,
    },

    /// Abort attempted on a committed transaction
    #[error("cannot abort {id}: transaction already {outcome}")]
    CannotAbort {
        /// Transaction
        id: TransactionId,
        /// The decision already reached
        outcome: Outcome,
    },

    /// The record is terminal and the operation would modify it
    #[error("{id} is no longer modifiable: transaction is {phase}")]
    NotModifiable {
        /// Transaction
        id: TransactionId,
        /// Phase observed
        phase: Phase,
    },

    /// The lease is cancelled, expired, or its transaction has settled
    #[error("unknown lease for {0}")]
    UnknownLease(TransactionId),

    /// A bounded wait elapsed
    #[error("timed out after {waited:?} waiting on {id}")]
    Timeout {
        /// Transaction
        id: TransactionId,
        /// How long the caller waited
        waited: Duration,
    },

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error (config files, worker threads)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TxnError {
    /// Whether this is an "unknown lease" condition
    pub fn is_unknown_lease(&self) -> bool {
        matches!(self, TxnError::UnknownLease(_))
    }

    /// Whether this is a "cannot commit" condition
    pub fn is_cannot_commit(&self) -> bool {
        matches!(self, TxnError::CannotCommit { .. })
    }

    /// Abort cause carried by a "cannot commit" condition
    pub fn abort_cause(&self) -> Option<&AbortCause> {
        match self {
            TxnError::CannotCommit { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Participant failure wrapped by this error, if any
    pub fn participant_error(&self) -> Option<&ParticipantError> {
        self.abort_cause().and_then(AbortCause::participant_error)
    }
}
