//! Core types for Covenant transactions
//!
//! This module defines the foundational types:
//! - TransactionId: identifier assigned by a manager at creation
//! - ManagerId: identity of a manager instance
//! - Phase: lifecycle state of a transaction record
//! - Outcome: the single decision a transaction reaches
//! - Vote / PrepareCommitOutcome: what participants answer

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a transaction
///
/// Assigned once at creation and never reused by the same manager.
/// Ordering exists for logging and debugging; it carries no protocol meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl From<u64> for TransactionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identity of a transaction manager instance
///
/// A wrapper around a UUID v4. Two managers never hand out leases that can
/// be confused with each other, even if their transaction ids overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagerId(Uuid);

impl ManagerId {
    /// Create a new random ManagerId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw bytes of the underlying UUID
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ManagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of a transaction record
///
/// State transitions:
/// - `Active` → `Voting` (commit requested)
/// - `Active` → `Aborted` (abort, lease cancel, lease expiry)
/// - `Voting` → `Committed` (every participant prepared)
/// - `Voting` → `Aborted` (abort vote, prepare failure, concurrent abort)
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `Aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Accepting joins; no decision requested yet
    Active,
    /// Commit requested, votes being collected
    Voting,
    /// Decided: committed
    Committed,
    /// Decided: aborted
    Aborted,
}

impl Phase {
    /// Whether this phase is a decision
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Committed | Phase::Aborted)
    }

    // Active=0, Voting=1, terminal=2. Committed and Aborted are incomparable
    // with each other but both sit above Voting.
    fn rank(&self) -> u8 {
        match self {
            Phase::Active => 0,
            Phase::Voting => 1,
            Phase::Committed | Phase::Aborted => 2,
        }
    }

    /// Whether `next` is a legal successor of this phase
    pub fn can_transition_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Active, Phase::Voting)
                | (Phase::Active, Phase::Aborted)
                | (Phase::Voting, Phase::Committed)
                | (Phase::Voting, Phase::Aborted)
        )
    }

    /// Whether a record in this phase is at or past `target`
    ///
    /// Any terminal phase counts as having passed `Active` and `Voting`.
    /// For a terminal `target` only that exact phase matches, except that
    /// reaching the other terminal phase also ends the wait (see
    /// `settles_wait_for`).
    pub fn has_reached(&self, target: Phase) -> bool {
        if target.is_terminal() {
            *self == target
        } else {
            self.rank() >= target.rank()
        }
    }

    /// Whether a waiter for `target` can stop waiting in this phase
    pub fn settles_wait_for(&self, target: Phase) -> bool {
        self.has_reached(target) || self.is_terminal()
    }

    /// The decision this phase represents, if any
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Phase::Committed => Some(Outcome::Committed),
            Phase::Aborted => Some(Outcome::Aborted),
            Phase::Active | Phase::Voting => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Active => "ACTIVE",
            Phase::Voting => "VOTING",
            Phase::Committed => "COMMITTED",
            Phase::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// The single decision a transaction reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// All participants prepared; the decision is to commit
    Committed,
    /// The decision is to abort
    Aborted,
}

impl From<Outcome> for Phase {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Committed => Phase::Committed,
            Outcome::Aborted => Phase::Aborted,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Phase::from(*self), f)
    }
}

/// Reply to a `prepare` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// The participant can commit and is waiting for the decision
    Prepared,
    /// The participant has aborted its part of the transaction
    Abort,
}

/// Reply to a combined `prepare_and_commit` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrepareCommitOutcome {
    /// The participant prepared and applied the commit
    Committed,
    /// The participant has aborted its part of the transaction
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Phase; 4] = [Phase::Active, Phase::Voting, Phase::Committed, Phase::Aborted];

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
    }

    #[test]
    fn test_transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
        assert_eq!(TransactionId::from(7).as_u64(), 7);
    }

    #[test]
    fn test_manager_id_unique() {
        assert_ne!(ManagerId::new(), ManagerId::new());
    }

    #[test]
    fn test_phase_legal_transitions() {
        assert!(Phase::Active.can_transition_to(Phase::Voting));
        assert!(Phase::Active.can_transition_to(Phase::Aborted));
        assert!(Phase::Voting.can_transition_to(Phase::Committed));
        assert!(Phase::Voting.can_transition_to(Phase::Aborted));
    }

    #[test]
    fn test_phase_illegal_transitions() {
        assert!(!Phase::Active.can_transition_to(Phase::Committed));
        assert!(!Phase::Voting.can_transition_to(Phase::Active));
        assert!(!Phase::Voting.can_transition_to(Phase::Voting));
        for next in ALL {
            assert!(!Phase::Committed.can_transition_to(next));
            assert!(!Phase::Aborted.can_transition_to(next));
        }
    }

    #[test]
    fn test_phase_has_reached() {
        assert!(Phase::Voting.has_reached(Phase::Active));
        assert!(Phase::Committed.has_reached(Phase::Voting));
        assert!(Phase::Aborted.has_reached(Phase::Voting));
        assert!(!Phase::Active.has_reached(Phase::Voting));
        assert!(!Phase::Aborted.has_reached(Phase::Committed));
        assert!(Phase::Aborted.settles_wait_for(Phase::Committed));
    }

    #[test]
    fn test_phase_outcome() {
        assert_eq!(Phase::Committed.outcome(), Some(Outcome::Committed));
        assert_eq!(Phase::Aborted.outcome(), Some(Outcome::Aborted));
        assert_eq!(Phase::Voting.outcome(), None);
        assert_eq!(Phase::from(Outcome::Aborted), Phase::Aborted);
        assert_eq!(Outcome::Committed.to_string(), "COMMITTED");
    }

    fn any_phase() -> impl Strategy<Value = Phase> {
        prop::sample::select(ALL.to_vec())
    }

    proptest! {
        /// Applying only legal transitions never moves a phase backwards
        /// and never leaves a terminal phase.
        #[test]
        fn prop_phase_is_monotonic(steps in prop::collection::vec(any_phase(), 0..16)) {
            let mut phase = Phase::Active;
            for next in steps {
                let before = phase;
                if phase.can_transition_to(next) {
                    phase = next;
                    prop_assert!(phase.rank() > before.rank());
                }
                if before.is_terminal() {
                    prop_assert_eq!(phase, before);
                }
            }
        }
    }
}
