//! Two-phase-commit coordinator
//!
//! Drives one transaction record to exactly one outcome.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. ACTIVE → VOTING under the record lock; registry frozen
//! 2. No participants:   decide COMMITTED
//!    One participant:   prepare_and_commit
//!    Many participants: prepare each in join order, lock released per call
//! 3. Abort vote / prepare failure / concurrent abort → ABORTED,
//!    abort sent to every participant that has not settled
//! 4. All prepared → COMMITTED (DECISION POINT)
//! 5. Roll-forward: commit each prepared participant; failures are
//!    reported, the outcome never changes
//! ```
//!
//! No participant call is made while the record lock is held. An `abort`
//! that arrives while a vote is outstanding is accepted at once; the
//! committing thread sends the in-flight participant its `abort` when that
//! call returns, and the late vote counts for nothing.
//!
//! If the committing thread unwinds out of a participant call, the record
//! is still settled: ABORTED (`Interrupted`) when no decision was reached,
//! or COMMITTED with every unconfirmed commit reported as a failure. Callers
//! waiting on the same commit are released either way.

use crate::lease::LeaseState;
use crate::record::{RecordState, TransactionRecord};
use crate::registry::{Progress, TerminalCall};
use covenant_core::{
    AbortCause, Clock, Expiration, LeaseDuration, LeasePolicy, Outcome, ParticipantError,
    ParticipantRef, Phase, PrepareCommitOutcome, Result, Timestamp, TransactionId, TxnError, Vote,
};
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry rule for commit calls that fail with a communication error
///
/// Protocol failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollForwardPolicy {
    /// Extra attempts after the first (0 = report the first failure)
    pub max_retries: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RollForwardPolicy {
    fn default() -> Self {
        RollForwardPolicy {
            max_retries: 0,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A commit call that failed during roll-forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollForwardFailure {
    /// Position of the participant in join order
    pub participant: usize,
    /// Last error returned
    pub error: ParticipantError,
    /// Calls made
    pub attempts: u32,
}

impl RollForwardFailure {
    /// A participant rejected a commit it had voted for
    pub fn is_anomaly(&self) -> bool {
        self.error.is_protocol()
    }
}

/// Result of a committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    /// Transaction
    pub id: TransactionId,
    /// Number of joined participants
    pub participants: usize,
    /// Commit calls that did not succeed
    pub failures: Vec<RollForwardFailure>,
}

impl CommitReport {
    /// Every participant acknowledged the commit
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Protocol rejections after a prepared vote
    pub fn anomalies(&self) -> impl Iterator<Item = &RollForwardFailure> {
        self.failures.iter().filter(|f| f.is_anomaly())
    }

    /// Commit calls lost to communication failures
    pub fn communication_failures(&self) -> impl Iterator<Item = &RollForwardFailure> {
        self.failures.iter().filter(|f| !f.is_anomaly())
    }
}

/// Outcome totals since the coordinator was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Transactions decided COMMITTED
    pub committed: u64,
    /// Transactions decided ABORTED, for any cause
    pub aborted: u64,
    /// Aborts caused by lease expiry
    pub expired: u64,
    /// Commit calls that failed during roll-forward
    pub roll_forward_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    aborted: AtomicU64,
    expired: AtomicU64,
    roll_forward_failures: AtomicU64,
}

type Deliveries = Vec<(usize, ParticipantRef)>;

/// Drives the two-phase-commit protocol and the lease rules for records
pub struct Coordinator {
    lease_policy: LeasePolicy,
    roll_forward: RollForwardPolicy,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("lease_policy", &self.lease_policy)
            .field("roll_forward", &self.roll_forward)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator
    pub fn new(lease_policy: LeasePolicy, roll_forward: RollForwardPolicy, clock: Arc<dyn Clock>) -> Self {
        Coordinator {
            lease_policy,
            roll_forward,
            clock,
            counters: Counters::default(),
        }
    }

    /// Outcome totals so far
    pub fn outcome_counts(&self) -> OutcomeCounts {
        OutcomeCounts {
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            roll_forward_failures: self.counters.roll_forward_failures.load(Ordering::Relaxed),
        }
    }

    /// Current time on the coordinator's clock
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Lease grant rules
    pub fn lease_policy(&self) -> &LeasePolicy {
        &self.lease_policy
    }

    /// Create an ACTIVE record holding a fresh lease
    pub fn new_record(&self, id: TransactionId, requested: LeaseDuration) -> TransactionRecord {
        let now = self.clock.now();
        let lease = LeaseState::grant(&self.lease_policy, requested, now);
        debug!(target: "covenant::lease", txn = %id, expiration = %lease.expiration(), "Lease granted");
        TransactionRecord::new(id, lease, now)
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    /// Enlist a participant
    ///
    /// Returns its position in join order. Fails with `CannotJoin` unless the
    /// record is ACTIVE.
    pub fn join(&self, record: &TransactionRecord, participant: ParticipantRef) -> Result<usize> {
        let id = record.id();
        let mut state = record.lock();
        if let Some(aborts) = self.expire_if_lapsed(record, &mut state) {
            let phase = state.phase;
            drop(state);
            self.deliver_aborts(id, aborts);
            return Err(TxnError::CannotJoin { id, phase });
        }
        if state.phase != Phase::Active {
            return Err(TxnError::CannotJoin {
                id,
                phase: state.phase,
            });
        }
        match state.registry.join(participant) {
            Some(index) => {
                debug!(target: "covenant::txn", txn = %id, participant = index, "Participant joined");
                Ok(index)
            }
            None => Err(TxnError::CannotJoin {
                id,
                phase: state.phase,
            }),
        }
    }

    /// Run two-phase commit
    ///
    /// A caller that finds the record already VOTING waits for that vote's
    /// outcome instead of starting another.
    ///
    /// # Returns
    /// - Ok(CommitReport): COMMITTED, with any roll-forward failures
    /// - Err(CannotCommit): ABORTED, with the cause
    /// - Err(NotModifiable): the record had already committed
    pub fn commit(&self, record: &TransactionRecord) -> Result<CommitReport> {
        let id = record.id();
        let participants = {
            let mut state = record.lock();
            if let Some(aborts) = self.expire_if_lapsed(record, &mut state) {
                drop(state);
                self.deliver_aborts(id, aborts);
                return Err(TxnError::CannotCommit {
                    id,
                    cause: AbortCause::LeaseExpired,
                });
            }
            match state.phase {
                Phase::Active => {}
                Phase::Voting => return self.await_decision(record, state),
                Phase::Committed => {
                    return Err(TxnError::NotModifiable {
                        id,
                        phase: Phase::Committed,
                    })
                }
                Phase::Aborted => return Err(cannot_commit(id, &state)),
            }
            state.transition(Phase::Voting, self.clock.now());
            state.registry.freeze();
            record.notify();
            state.registry.len()
        };
        let _unwind = UnwindGuard {
            coordinator: self,
            record,
        };

        debug!(target: "covenant::txn", txn = %id, participants, "Voting started");

        let decision = match participants {
            0 => self.decide(record, Outcome::Committed, None),
            1 => self.vote_single(record),
            _ => self.vote_each(record, participants),
        };

        match decision {
            Outcome::Committed => Ok(self.roll_forward(record)),
            Outcome::Aborted => {
                let (err, aborts) = {
                    let mut state = record.lock();
                    (cannot_commit(id, &state), state.registry.claim_all(TerminalCall::Abort))
                };
                self.deliver_aborts(id, aborts);
                Err(err)
            }
        }
    }

    /// Abort
    ///
    /// Accepted immediately even while a vote is outstanding. Idempotent on
    /// an aborted record; fails with `CannotAbort` on a committed one.
    pub fn abort(&self, record: &TransactionRecord) -> Result<()> {
        let id = record.id();
        let aborts = {
            let mut state = record.lock();
            match state.phase {
                Phase::Aborted => return Ok(()),
                Phase::Committed => {
                    return Err(TxnError::CannotAbort {
                        id,
                        outcome: Outcome::Committed,
                    })
                }
                Phase::Active | Phase::Voting => {}
            }
            let cause = if state.lease.has_lapsed(self.clock.now()) {
                state.lease.mark_expired();
                AbortCause::LeaseExpired
            } else {
                AbortCause::Requested
            };
            self.abort_locked(record, &mut state, cause)
        };
        self.deliver_aborts(id, aborts);
        Ok(())
    }

    // ========================================================================
    // Lease operations
    // ========================================================================

    /// Extend the lease from now
    ///
    /// Fails with `UnknownLease` once the lease is cancelled or lapsed, or
    /// the transaction has settled.
    pub fn renew(&self, record: &TransactionRecord, requested: LeaseDuration) -> Result<Expiration> {
        let id = record.id();
        let mut state = record.lock();
        if let Some(aborts) = self.expire_if_lapsed(record, &mut state) {
            drop(state);
            self.deliver_aborts(id, aborts);
            return Err(TxnError::UnknownLease(id));
        }
        if state.phase.is_terminal() {
            return Err(TxnError::UnknownLease(id));
        }
        match state.lease.renew(&self.lease_policy, requested, self.clock.now()) {
            Some(expiration) => {
                debug!(target: "covenant::lease", txn = %id, expiration = %expiration, "Lease renewed");
                Ok(expiration)
            }
            None => Err(TxnError::UnknownLease(id)),
        }
    }

    /// Cancel the lease, forfeiting an undecided transaction
    pub fn cancel(&self, record: &TransactionRecord) -> Result<()> {
        let id = record.id();
        let mut state = record.lock();
        if let Some(aborts) = self.expire_if_lapsed(record, &mut state) {
            drop(state);
            self.deliver_aborts(id, aborts);
            return Err(TxnError::UnknownLease(id));
        }
        if state.phase.is_terminal() || !state.lease.cancel(self.clock.now()) {
            return Err(TxnError::UnknownLease(id));
        }
        let aborts = self.abort_locked(record, &mut state, AbortCause::LeaseCancelled);
        drop(state);
        info!(target: "covenant::lease", txn = %id, "Lease cancelled");
        self.deliver_aborts(id, aborts);
        Ok(())
    }

    /// Abort the record if its lease lapsed while undecided
    ///
    /// Returns `true` if this call aborted it.
    pub fn expire(&self, record: &TransactionRecord) -> bool {
        let aborts = {
            let mut state = record.lock();
            match self.expire_if_lapsed(record, &mut state) {
                Some(aborts) => aborts,
                None => return false,
            }
        };
        self.deliver_aborts(record.id(), aborts);
        true
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn expire_if_lapsed(&self, record: &TransactionRecord, state: &mut RecordState) -> Option<Deliveries> {
        if state.phase.is_terminal() || !state.lease.has_lapsed(self.clock.now()) {
            return None;
        }
        state.lease.mark_expired();
        info!(target: "covenant::lease", txn = %record.id(), phase = %state.phase, "Lease expired");
        Some(self.abort_locked(record, state, AbortCause::LeaseExpired))
    }

    // Move to ABORTED and claim every participant that can take `abort` now.
    // A participant with a prepare outstanding is left to the committing thread.
    fn abort_locked(&self, record: &TransactionRecord, state: &mut RecordState, cause: AbortCause) -> Deliveries {
        if !state.transition(Phase::Aborted, self.clock.now()) {
            return Vec::new();
        }
        info!(target: "covenant::txn", txn = %record.id(), cause = %cause, "Transaction aborted");
        self.count_abort(&cause);
        state.abort_cause = Some(cause);
        record.notify();
        state.registry.claim_all(TerminalCall::Abort)
    }

    fn count_abort(&self, cause: &AbortCause) {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        if *cause == AbortCause::LeaseExpired {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decide(&self, record: &TransactionRecord, outcome: Outcome, cause: Option<AbortCause>) -> Outcome {
        let mut state = record.lock();
        self.decide_locked(record, &mut state, outcome, cause)
    }

    // The first decision wins. Only an abort can race with a vote, so a
    // record that left VOTING underneath us is ABORTED.
    fn decide_locked(
        &self,
        record: &TransactionRecord,
        state: &mut RecordState,
        outcome: Outcome,
        cause: Option<AbortCause>,
    ) -> Outcome {
        if state.phase != Phase::Voting {
            return state.phase.outcome().unwrap_or(Outcome::Aborted);
        }
        let now = self.clock.now();
        if outcome == Outcome::Committed && state.lease.has_lapsed(now) {
            state.lease.mark_expired();
            return self.decide_locked(record, state, Outcome::Aborted, Some(AbortCause::LeaseExpired));
        }
        state.transition(outcome.into(), now);
        if outcome == Outcome::Aborted {
            let cause = cause.unwrap_or(AbortCause::Requested);
            info!(target: "covenant::txn", txn = %record.id(), cause = %cause, "Decided to abort");
            self.count_abort(&cause);
            state.abort_cause = Some(cause);
        } else {
            debug!(target: "covenant::txn", txn = %record.id(), "Decided to commit");
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
        }
        record.notify();
        outcome
    }

    fn vote_single(&self, record: &TransactionRecord) -> Outcome {
        let id = record.id();
        let participant = {
            let mut state = record.lock();
            if state.phase != Phase::Voting {
                return Outcome::Aborted;
            }
            match state.registry.begin_prepare(0) {
                Some(participant) => participant,
                None => return self.decide_locked(record, &mut state, Outcome::Aborted, None),
            }
        };

        let reply = participant.prepare_and_commit(id);

        let mut state = record.lock();
        match reply {
            Ok(PrepareCommitOutcome::Committed) => {
                let outcome = self.decide_locked(record, &mut state, Outcome::Committed, None);
                if outcome == Outcome::Committed {
                    state
                        .registry
                        .finish_prepare(0, Progress::Settled(TerminalCall::CommittedInPrepare));
                } else {
                    warn!(
                        target: "covenant::txn",
                        txn = %id,
                        "Participant committed after the transaction aborted; sending abort"
                    );
                    state.registry.finish_prepare(0, Progress::Prepared);
                }
                outcome
            }
            Ok(PrepareCommitOutcome::Abort) => {
                state
                    .registry
                    .finish_prepare(0, Progress::Settled(TerminalCall::SelfAborted));
                self.decide_locked(record, &mut state, Outcome::Aborted, Some(AbortCause::VotedAbort { participant: 0 }))
            }
            Err(err) => {
                warn!(target: "covenant::txn", txn = %id, participant = 0, error = %err, "prepare_and_commit failed");
                state.registry.finish_prepare(0, Progress::Unresolved);
                self.decide_locked(
                    record,
                    &mut state,
                    Outcome::Aborted,
                    Some(AbortCause::PrepareFailed {
                        participant: 0,
                        error: err,
                    }),
                )
            }
        }
    }

    fn vote_each(&self, record: &TransactionRecord, count: usize) -> Outcome {
        let id = record.id();
        for index in 0..count {
            let participant = {
                let mut state = record.lock();
                if state.phase != Phase::Voting {
                    return Outcome::Aborted;
                }
                match state.registry.begin_prepare(index) {
                    Some(participant) => participant,
                    None => continue,
                }
            };

            let vote = participant.prepare(id);

            let mut state = record.lock();
            match vote {
                Ok(Vote::Prepared) => state.registry.finish_prepare(index, Progress::Prepared),
                Ok(Vote::Abort) => {
                    debug!(target: "covenant::txn", txn = %id, participant = index, "Participant voted abort");
                    state
                        .registry
                        .finish_prepare(index, Progress::Settled(TerminalCall::SelfAborted));
                    return self.decide_locked(
                        record,
                        &mut state,
                        Outcome::Aborted,
                        Some(AbortCause::VotedAbort { participant: index }),
                    );
                }
                Err(err) => {
                    warn!(target: "covenant::txn", txn = %id, participant = index, error = %err, "Prepare failed");
                    state.registry.finish_prepare(index, Progress::Unresolved);
                    return self.decide_locked(
                        record,
                        &mut state,
                        Outcome::Aborted,
                        Some(AbortCause::PrepareFailed {
                            participant: index,
                            error: err,
                        }),
                    );
                }
            }
        }
        self.decide(record, Outcome::Committed, None)
    }

    fn roll_forward(&self, record: &TransactionRecord) -> CommitReport {
        let id = record.id();
        let (participants, commits) = {
            let mut state = record.lock();
            (state.registry.len(), state.registry.claim_all(TerminalCall::Commit))
        };

        let failures: Vec<RollForwardFailure> = commits
            .into_iter()
            .filter_map(|(index, participant)| self.deliver_commit(id, index, &participant).err())
            .collect();

        self.counters
            .roll_forward_failures
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        if failures.is_empty() {
            info!(target: "covenant::txn", txn = %id, participants, "Transaction committed");
        } else {
            warn!(
                target: "covenant::txn",
                txn = %id,
                participants,
                failures = failures.len(),
                "Transaction committed; some participants were not rolled forward"
            );
        }

        let report = CommitReport {
            id,
            participants,
            failures,
        };
        let mut state = record.lock();
        state.commit_report = Some(report.clone());
        record.notify();
        report
    }

    fn deliver_commit(
        &self,
        id: TransactionId,
        index: usize,
        participant: &ParticipantRef,
    ) -> std::result::Result<(), RollForwardFailure> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match participant.commit(id) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_communication() && attempts <= self.roll_forward.max_retries => {
                    warn!(
                        target: "covenant::txn",
                        txn = %id,
                        participant = index,
                        attempt = attempts,
                        error = %err,
                        "Commit delivery failed; retrying"
                    );
                    thread::sleep(self.roll_forward.backoff);
                }
                Err(err) => {
                    if err.is_protocol() {
                        error!(
                            target: "covenant::txn",
                            txn = %id,
                            participant = index,
                            error = %err,
                            "Participant rejected commit after voting prepared"
                        );
                    } else {
                        warn!(
                            target: "covenant::txn",
                            txn = %id,
                            participant = index,
                            attempts,
                            error = %err,
                            "Commit delivery failed"
                        );
                    }
                    return Err(RollForwardFailure {
                        participant: index,
                        error: err,
                        attempts,
                    });
                }
            }
        }
    }

    fn deliver_aborts(&self, id: TransactionId, aborts: Deliveries) {
        for (index, participant) in aborts {
            if let Err(err) = participant.abort(id) {
                warn!(target: "covenant::txn", txn = %id, participant = index, error = %err, "Abort delivery failed");
            }
        }
    }

    // Settle a record whose committing thread is unwinding. No participant is
    // called from here.
    fn settle_interrupted(&self, record: &TransactionRecord) {
        let id = record.id();
        let mut state = record.lock();
        match state.phase {
            Phase::Voting => {
                state.transition(Phase::Aborted, self.clock.now());
                error!(target: "covenant::txn", txn = %id, "Commit interrupted before a decision; aborted");
                self.count_abort(&AbortCause::Interrupted);
                state.abort_cause = Some(AbortCause::Interrupted);
            }
            Phase::Committed if state.commit_report.is_none() => {
                let failures: Vec<RollForwardFailure> = state
                    .registry
                    .committed()
                    .map(|participant| RollForwardFailure {
                        participant,
                        error: ParticipantError::communication("roll-forward interrupted"),
                        attempts: 0,
                    })
                    .collect();
                error!(
                    target: "covenant::txn",
                    txn = %id,
                    unconfirmed = failures.len(),
                    "Roll-forward interrupted"
                );
                self.counters
                    .roll_forward_failures
                    .fetch_add(failures.len() as u64, Ordering::Relaxed);
                state.commit_report = Some(CommitReport {
                    id,
                    participants: state.registry.len(),
                    failures,
                });
            }
            _ => return,
        }
        record.notify();
    }

    fn await_decision(
        &self,
        record: &TransactionRecord,
        mut state: MutexGuard<'_, RecordState>,
    ) -> Result<CommitReport> {
        debug!(target: "covenant::txn", txn = %record.id(), "Commit already in progress; waiting");
        record.wait_while_locked(&mut state, None, |s| {
            s.phase == Phase::Aborted || s.commit_report.is_some()
        });
        match (state.phase, state.commit_report.clone()) {
            (Phase::Committed, Some(report)) => Ok(report),
            _ => Err(cannot_commit(record.id(), &state)),
        }
    }
}

struct UnwindGuard<'a> {
    coordinator: &'a Coordinator,
    record: &'a TransactionRecord,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.coordinator.settle_interrupted(self.record);
        }
    }
}

fn cannot_commit(id: TransactionId, state: &RecordState) -> TxnError {
    TxnError::CannotCommit {
        id,
        cause: state.abort_cause.clone().unwrap_or(AbortCause::Requested),
    }
}
