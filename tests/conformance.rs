//! Conformance tests for the Covenant transaction manager
//!
//! Each section exercises one observable guarantee of the public API, end to
//! end through `TransactionManager`.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use covenant::testing::{Call, Gate, Script, ScriptedParticipant, Step};
use covenant::{
    AbortCause, Expiration, LeaseDuration, ManagerConfig, ManualClock, Phase, ParticipantError,
    TransactionId, TransactionManager, TxnError,
};
use proptest::prelude::*;
use rand::Rng;

// ============================================================================
// Test Helpers
// ============================================================================

fn manager() -> (Arc<TransactionManager>, ManualClock) {
    let clock = ManualClock::default();
    let config = ManagerConfig {
        sweep_interval_ms: 0,
        ..ManagerConfig::default()
    };
    let manager = TransactionManager::with_clock(config, Arc::new(clock.clone())).unwrap();
    (Arc::new(manager), clock)
}

fn create(manager: &TransactionManager) -> TransactionId {
    manager.create(LeaseDuration::Forever).unwrap().transaction
}

fn prepared_participants(n: usize) -> Vec<Arc<ScriptedParticipant>> {
    (0..n)
        .map(|i| ScriptedParticipant::new(format!("p{}", i), Script::prepared()))
        .collect()
}

// ============================================================================
// Single Outcome
// ============================================================================

mod single_outcome {
    use super::*;

    #[test]
    fn test_racing_commit_and_abort_settle_once() {
        let (manager, _clock) = manager();
        for _ in 0..25 {
            let id = create(&manager);
            let parts = prepared_participants(2);
            for p in &parts {
                manager.join(id, p.clone()).unwrap();
            }

            let barrier = Arc::new(Barrier::new(3));
            let spawn = |commit: bool| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if commit {
                        manager.commit(id).map(|_| ())
                    } else {
                        manager.abort(id)
                    }
                })
            };
            let c = spawn(true);
            let a = spawn(false);
            barrier.wait();
            let (c, a) = (c.join().unwrap(), a.join().unwrap());

            let phase = manager.get_state(id).unwrap();
            assert!(phase.is_terminal());
            assert_eq!(c.is_ok(), phase == Phase::Committed);
            assert_eq!(a.is_ok(), phase == Phase::Aborted);
            // settled records never move again
            let _ = manager.commit(id);
            let _ = manager.abort(id);
            assert_eq!(manager.get_state(id).unwrap(), phase);
            for p in &parts {
                assert_eq!(p.terminal_calls(id), 1);
            }
        }
    }
}

// ============================================================================
// Monotonic Phase
// ============================================================================

mod monotonic_phase {
    use super::*;

    #[test]
    fn test_settled_transactions_reject_changes() {
        let (manager, _clock) = manager();
        let committed = create(&manager);
        manager.commit(committed).unwrap();
        assert!(matches!(manager.commit(committed), Err(TxnError::NotModifiable { .. })));
        assert!(matches!(manager.abort(committed), Err(TxnError::CannotAbort { .. })));

        let aborted = create(&manager);
        manager.abort(aborted).unwrap();
        assert!(manager.commit(aborted).unwrap_err().is_cannot_commit());
        assert_eq!(manager.get_state(aborted).unwrap(), Phase::Aborted);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any sequence of operations leaves the phase on the allowed path.
        #[test]
        fn prop_phase_follows_allowed_path(ops in prop::collection::vec(0u8..4, 1..12)) {
            let (manager, _clock) = manager();
            let id = create(&manager);
            let mut seen = vec![Phase::Active];
            for op in ops {
                match op {
                    0 => { let _ = manager.commit(id); }
                    1 => { let _ = manager.abort(id); }
                    2 => { let _ = manager.join(id, ScriptedParticipant::new("p", Script::prepared())); }
                    _ => { let _ = manager.renew(id, LeaseDuration::Any); }
                }
                let phase = manager.get_state(id).unwrap();
                let last = *seen.last().unwrap();
                prop_assert!(phase == last || last.can_transition_to(phase) || (last == Phase::Active && phase.is_terminal()));
                seen.push(phase);
            }
        }
    }
}

// ============================================================================
// Join Freeze
// ============================================================================

mod join_freeze {
    use super::*;

    #[test]
    fn test_join_after_voting_fails() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let gate = Gate::new();
        let a = ScriptedParticipant::new("a", Script::prepared().hold_prepare(gate.clone()));
        let b = ScriptedParticipant::new("b", Script::prepared());
        assert_eq!(manager.join(id, a).unwrap(), 0);
        assert_eq!(manager.join(id, b.clone()).unwrap(), 1);

        let committer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.commit(id))
        };
        assert!(gate.wait_parked(1, Duration::from_secs(5)));

        let late = ScriptedParticipant::new("late", Script::prepared());
        assert!(matches!(
            manager.join(id, late.clone()),
            Err(TxnError::CannotJoin { phase: Phase::Voting, .. })
        ));
        gate.open();
        assert_eq!(committer.join().unwrap().unwrap().participants, 2);
        assert!(late.calls(id).is_empty());
    }

    #[test]
    fn test_prepare_follows_join_order() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let log = ScriptedParticipant::new("shared", Script::prepared());
        let parts = prepared_participants(4);
        for p in &parts {
            manager.join(id, p.clone()).unwrap();
        }
        manager.join(id, log.clone()).unwrap();
        manager.commit(id).unwrap();

        // the shared participant was joined last, so it was prepared last
        assert_eq!(log.calls(id), vec![Call::Prepare, Call::Commit]);
        for p in &parts {
            assert_eq!(p.calls(id), vec![Call::Prepare, Call::Commit]);
        }
    }
}

// ============================================================================
// Lease Expiration
// ============================================================================

mod lease_expiration {
    use super::*;

    #[test]
    fn test_expired_lease_cannot_be_cancelled() {
        let (manager, clock) = manager();
        let created = manager.create(LeaseDuration::from_secs(60)).unwrap();
        clock.advance(Duration::from_secs(61));

        assert!(created.lease.cancel().unwrap_err().is_unknown_lease());
        assert!(manager
            .renew(created.transaction, LeaseDuration::Any)
            .unwrap_err()
            .is_unknown_lease());
        assert_eq!(manager.get_state(created.transaction).unwrap(), Phase::Aborted);
    }

    #[test]
    fn test_grant_clipping() {
        let clock = ManualClock::default();
        let config = ManagerConfig {
            sweep_interval_ms: 0,
            default_lease_ms: 30_000,
            max_lease_ms: Some(60_000),
            ..ManagerConfig::default()
        };
        let manager = TransactionManager::with_clock(config, Arc::new(clock.clone())).unwrap();

        let long = manager.create(LeaseDuration::from_secs(600)).unwrap();
        let any = manager.create(LeaseDuration::Any).unwrap();
        let short = manager.create(LeaseDuration::from_secs(5)).unwrap();
        let expiry = |created: &covenant::Created| match created.lease.expiration() {
            Expiration::At(at) => at.as_millis(),
            Expiration::Never => u64::MAX,
        };
        let start = expiry(&short) - 5_000;
        assert_eq!(expiry(&long) - start, 60_000);
        assert_eq!(expiry(&any) - start, 30_000);
    }

    #[test]
    fn test_committed_lease_cannot_be_renewed() {
        let (manager, _clock) = manager();
        let mut created = manager.create(LeaseDuration::from_secs(60)).unwrap();
        manager.commit(created.transaction).unwrap();
        assert!(created.lease.renew(LeaseDuration::from_secs(60)).unwrap_err().is_unknown_lease());
    }

    #[test]
    fn test_settled_record_evicted_after_retention() {
        let (manager, clock) = manager();
        let id = create(&manager);
        manager.commit(id).unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(manager.sweep().evicted, 0);
        assert_eq!(manager.get_state(id).unwrap(), Phase::Committed);

        clock.advance(Duration::from_secs(31));
        assert_eq!(manager.sweep().evicted, 1);
        assert!(matches!(manager.get_state(id), Err(TxnError::UnknownTransaction(_))));
    }
}

// ============================================================================
// Many Participants
// ============================================================================

mod many_participants {
    use super::*;

    #[test]
    fn test_thousand_participants_commit() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let parts = prepared_participants(1000);
        for p in &parts {
            manager.join(id, p.clone()).unwrap();
        }

        let report = manager.commit(id).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.participants, 1000);
        for p in &parts {
            assert_eq!(p.terminal_calls(id), 1);
        }
    }
}

// ============================================================================
// Roll-Forward Resilience
// ============================================================================

mod roll_forward {
    use super::*;

    #[test]
    fn test_commit_failures_do_not_change_outcome() {
        let (manager, _clock) = manager();
        let parts = prepared_participants(1000);
        let misbehaving = &parts[rand::thread_rng().gen_range(0..parts.len())];

        // first transaction: lost commit
        misbehaving.set_script(
            Script::prepared().on_commit(Step::Fail(ParticipantError::communication("connection reset"))),
        );
        let first = create(&manager);
        for p in &parts {
            manager.join(first, p.clone()).unwrap();
        }
        let report = manager.commit(first).unwrap();
        assert_eq!(manager.get_state(first).unwrap(), Phase::Committed);
        assert_eq!(report.communication_failures().count(), 1);
        assert_eq!(report.anomalies().count(), 0);

        // second transaction: protocol rejection
        misbehaving.set_script(
            Script::prepared().on_commit(Step::Fail(ParticipantError::protocol("unknown transaction"))),
        );
        let second = create(&manager);
        for p in &parts {
            manager.join(second, p.clone()).unwrap();
        }
        let report = manager.commit(second).unwrap();
        assert_eq!(manager.get_state(second).unwrap(), Phase::Committed);
        assert_eq!(report.anomalies().count(), 1);
        assert_eq!(manager.metrics().roll_forward_failures, 2);
    }
}

// ============================================================================
// Concurrent Abort During Slow Prepare
// ============================================================================

mod abort_during_prepare {
    use super::*;

    #[test]
    fn test_abort_completes_while_participant_is_slow() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let gate = Gate::new();
        let slow = ScriptedParticipant::new("slow", Script::prepared().hold_prepare(gate.clone()));
        manager.join(id, slow.clone()).unwrap();

        let committer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.commit(id))
        };
        assert_eq!(
            manager
                .wait_for_phase(id, Phase::Voting, Duration::from_secs(5))
                .unwrap(),
            Phase::Voting
        );
        assert!(gate.wait_parked(1, Duration::from_secs(5)));

        manager.abort(id).unwrap();
        assert_eq!(manager.get_state(id).unwrap(), Phase::Aborted);

        gate.open();
        assert!(committer.join().unwrap().unwrap_err().is_cannot_commit());
        assert_eq!(slow.count(id, Call::Abort), 1);
        assert_eq!(slow.count(id, Call::Commit), 0);
    }
}

// ============================================================================
// Participant Failure During Prepare
// ============================================================================

mod prepare_failure {
    use super::*;

    #[test]
    fn test_cannot_commit_wraps_participant_error() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let failure = ParticipantError::protocol("participant crashed mid-protocol");
        let p = ScriptedParticipant::new(
            "thrower",
            Script::prepared().on_prepare_and_commit(Step::Fail(failure.clone())),
        );
        manager.join(id, p).unwrap();

        let err = manager.commit(id).unwrap_err();
        assert!(err.is_cannot_commit());
        assert_eq!(err.participant_error(), Some(&failure));
        assert!(matches!(
            err.abort_cause(),
            Some(AbortCause::PrepareFailed { participant: 0, .. })
        ));
    }
}

// ============================================================================
// Collapsed Commits
// ============================================================================

mod collapsed_commits {
    use super::*;

    #[test]
    fn test_concurrent_commits_prepare_once() {
        let (manager, _clock) = manager();
        let id = create(&manager);
        let parts = prepared_participants(3);
        for p in &parts {
            manager.join(id, p.clone()).unwrap();
        }

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.commit(id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // the first caller and anyone who waited on it get the report;
        // callers arriving after the decision see it as already settled
        assert!(results.iter().any(|r| r.is_ok()));
        for r in &results {
            assert!(matches!(r, Ok(_) | Err(TxnError::NotModifiable { .. })));
        }
        for p in &parts {
            assert_eq!(p.count(id, Call::Prepare), 1);
            assert_eq!(p.terminal_calls(id), 1);
        }
    }
}
