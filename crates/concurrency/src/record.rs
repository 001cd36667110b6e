//! Transaction record
//!
//! Per-transaction state: phase, participants, lease, and the decision's
//! details. The record's mutex is the single critical section for every
//! mutation of one transaction; records never share a lock. The condvar is
//! signalled whenever the phase changes or roll-forward completes, so
//! callers wait for progress instead of polling.

use crate::coordinator::CommitReport;
use crate::lease::LeaseState;
use crate::registry::ParticipantRegistry;
use covenant_core::{AbortCause, Expiration, Phase, Timestamp, TransactionId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Mutable state of a record, guarded by the record lock
#[derive(Debug)]
pub struct RecordState {
    pub(crate) phase: Phase,
    pub(crate) registry: ParticipantRegistry,
    pub(crate) lease: LeaseState,
    pub(crate) abort_cause: Option<AbortCause>,
    pub(crate) commit_report: Option<CommitReport>,
    pub(crate) settled_at: Option<Timestamp>,
}

impl RecordState {
    /// Move to `next` if that is a legal transition
    ///
    /// Terminal phases also stamp `settled_at`.
    pub(crate) fn transition(&mut self, next: Phase, now: Timestamp) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        if next.is_terminal() {
            self.registry.freeze();
            self.settled_at = Some(now);
        }
        true
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Participants in join order
    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    /// The lease
    pub fn lease(&self) -> &LeaseState {
        &self.lease
    }
}

/// One transaction
#[derive(Debug)]
pub struct TransactionRecord {
    id: TransactionId,
    created_at: Timestamp,
    state: Mutex<RecordState>,
    changed: Condvar,
}

impl TransactionRecord {
    /// New ACTIVE record with an open registry
    pub fn new(id: TransactionId, lease: LeaseState, created_at: Timestamp) -> Self {
        TransactionRecord {
            id,
            created_at,
            state: Mutex::new(RecordState {
                phase: Phase::Active,
                registry: ParticipantRegistry::new(),
                lease,
                abort_cause: None,
                commit_report: None,
                settled_at: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// When the record was created
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Number of joined participants
    pub fn participant_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Why the record aborted, once it has
    pub fn abort_cause(&self) -> Option<AbortCause> {
        self.state.lock().abort_cause.clone()
    }

    /// Report of the roll-forward, once it has finished
    pub fn commit_report(&self) -> Option<CommitReport> {
        self.state.lock().commit_report.clone()
    }

    /// Current lease expiration
    pub fn lease_expiration(&self) -> Expiration {
        self.state.lock().lease.expiration()
    }

    /// Whether the record settled more than `retention` before `now`
    pub fn is_evictable(&self, now: Timestamp, retention: Duration) -> bool {
        let state = self.state.lock();
        match state.settled_at {
            Some(at) if state.phase.is_terminal() => now > at.saturating_add(retention),
            _ => false,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock()
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block on `guard` until `done` holds or `timeout` elapses
    ///
    /// Returns `false` on timeout. `None`, or a timeout too large to
    /// represent as a deadline, waits without bound.
    pub(crate) fn wait_while_locked<F>(
        &self,
        guard: &mut MutexGuard<'_, RecordState>,
        timeout: Option<Duration>,
        mut done: F,
    ) -> bool
    where
        F: FnMut(&RecordState) -> bool,
    {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while !done(&**guard) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(guard, deadline).timed_out() {
                        return done(&**guard);
                    }
                }
                None => self.changed.wait(guard),
            }
        }
        true
    }

    /// Wait until the phase reaches `target`, or any terminal phase
    ///
    /// Returns the phase observed, or `None` if `timeout` elapsed first.
    pub fn wait_for_phase(&self, target: Phase, timeout: Option<Duration>) -> Option<Phase> {
        let mut state = self.state.lock();
        if self.wait_while_locked(&mut state, timeout, |s| s.phase.settles_wait_for(target)) {
            Some(state.phase)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_core::{LeaseDuration, LeasePolicy};
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(TransactionRecord: Send, Sync);

    fn record() -> TransactionRecord {
        let now = Timestamp::from_secs(100);
        let lease = LeaseState::grant(&LeasePolicy::default(), LeaseDuration::Forever, now);
        TransactionRecord::new(TransactionId::new(1), lease, now)
    }

    #[test]
    fn test_new_record_is_active() {
        let record = record();
        assert_eq!(record.phase(), Phase::Active);
        assert_eq!(record.participant_count(), 0);
        assert_eq!(record.created_at(), Timestamp::from_secs(100));
        assert_eq!(record.lease_expiration(), Expiration::Never);
        assert!(record.abort_cause().is_none());
    }

    #[test]
    fn test_transition_rejects_backwards() {
        let record = record();
        let mut state = record.lock();
        assert!(state.transition(Phase::Voting, Timestamp::from_secs(101)));
        assert!(!state.transition(Phase::Active, Timestamp::from_secs(102)));
        assert!(state.settled_at.is_none());
        assert!(state.transition(Phase::Committed, Timestamp::from_secs(103)));
        assert!(!state.transition(Phase::Aborted, Timestamp::from_secs(104)));
        assert_eq!(state.settled_at, Some(Timestamp::from_secs(103)));
        assert!(state.registry.is_frozen());
    }

    #[test]
    fn test_evictable_after_retention() {
        let record = record();
        record.lock().transition(Phase::Aborted, Timestamp::from_secs(200));
        let retention = Duration::from_secs(60);
        assert!(!record.is_evictable(Timestamp::from_secs(260), retention));
        assert!(record.is_evictable(Timestamp::from_secs(261), retention));
    }

    #[test]
    fn test_wait_for_phase_times_out() {
        let record = record();
        assert_eq!(
            record.wait_for_phase(Phase::Voting, Some(Duration::from_millis(20))),
            None
        );
    }

    #[test]
    fn test_wait_for_phase_wakes_on_transition() {
        let record = Arc::new(record());
        let waiter = {
            let record = Arc::clone(&record);
            thread::spawn(move || record.wait_for_phase(Phase::Voting, Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        {
            let mut state = record.lock();
            state.transition(Phase::Voting, Timestamp::from_secs(101));
        }
        record.notify();
        assert_eq!(waiter.join().unwrap(), Some(Phase::Voting));
    }

    #[test]
    fn test_wait_for_phase_ends_on_other_terminal() {
        let record = record();
        record.lock().transition(Phase::Aborted, Timestamp::from_secs(101));
        assert_eq!(
            record.wait_for_phase(Phase::Committed, Some(Duration::from_millis(10))),
            Some(Phase::Aborted)
        );
    }

    #[test]
    fn test_wait_for_phase_with_unrepresentable_deadline() {
        let record = Arc::new(record());
        let waiter = {
            let record = Arc::clone(&record);
            thread::spawn(move || record.wait_for_phase(Phase::Committed, Some(Duration::MAX)))
        };
        thread::sleep(Duration::from_millis(20));
        record.lock().transition(Phase::Voting, Timestamp::from_secs(101));
        record.lock().transition(Phase::Committed, Timestamp::from_secs(102));
        record.notify();
        assert_eq!(waiter.join().unwrap(), Some(Phase::Committed));
        assert_eq!(
            record.wait_for_phase(Phase::Committed, Some(Duration::MAX)),
            Some(Phase::Committed)
        );
    }
}
