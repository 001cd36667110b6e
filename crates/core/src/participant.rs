//! The participant capability
//!
//! A participant is an external party enlisted in a transaction. Its calls
//! are blocking and may be slow; the coordinator never holds a record lock
//! while one is outstanding.

use crate::error::ParticipantError;
use crate::types::{PrepareCommitOutcome, TransactionId, Vote};
use std::fmt::Debug;
use std::sync::Arc;

/// Two-phase-commit verbs a joined party implements
///
/// Per participant the coordinator issues `prepare` (or `prepare_and_commit`)
/// first, then at most one of `commit` or `abort`.
pub trait Participant: Send + Sync + Debug {
    /// Phase 1: vote on whether the participant can commit `id`
    fn prepare(&self, id: TransactionId) -> Result<Vote, ParticipantError>;

    /// Phase 2: apply the commit decision
    fn commit(&self, id: TransactionId) -> Result<(), ParticipantError>;

    /// Phase 2: apply the abort decision
    fn abort(&self, id: TransactionId) -> Result<(), ParticipantError>;

    /// Both phases in one call, used when this is the only participant
    ///
    /// The default prepares and, if prepared, commits.
    fn prepare_and_commit(&self, id: TransactionId) -> Result<PrepareCommitOutcome, ParticipantError> {
        match self.prepare(id)? {
            Vote::Prepared => {
                self.commit(id)?;
                Ok(PrepareCommitOutcome::Committed)
            }
            Vote::Abort => Ok(PrepareCommitOutcome::Abort),
        }
    }
}

/// Shared handle to a participant
pub type ParticipantRef = Arc<dyn Participant>;
