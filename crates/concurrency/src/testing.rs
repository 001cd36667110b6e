//! Scripted participants for tests
//!
//! A [`ScriptedParticipant`] answers each call from a [`Script`] and records
//! every call it receives. A [`Gate`] parks prepare calls so tests can
//! interleave an abort with an outstanding vote.

use covenant_core::{Participant, ParticipantError, PrepareCommitOutcome, TransactionId, Vote};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Scripted reply to one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Return this value
    Reply(T),
    /// Fail with this error
    Fail(ParticipantError),
    /// Panic with this message
    Crash(&'static str),
}

impl<T: Clone> Step<T> {
    fn run(&self) -> Result<T, ParticipantError> {
        match self {
            Step::Reply(value) => Ok(value.clone()),
            Step::Fail(err) => Err(err.clone()),
            Step::Crash(message) => panic!("{}", message),
        }
    }
}

/// How a [`ScriptedParticipant`] answers
#[derive(Debug, Clone)]
pub struct Script {
    prepare: Step<Vote>,
    prepare_and_commit: Option<Step<PrepareCommitOutcome>>,
    commit: Step<()>,
    abort: Step<()>,
    hold: Option<Gate>,
    latency: Duration,
}

impl Script {
    /// Votes prepared and acknowledges everything
    pub fn prepared() -> Self {
        Script {
            prepare: Step::Reply(Vote::Prepared),
            prepare_and_commit: None,
            commit: Step::Reply(()),
            abort: Step::Reply(()),
            hold: None,
            latency: Duration::ZERO,
        }
    }

    /// Votes abort
    pub fn voting_abort() -> Self {
        Script {
            prepare: Step::Reply(Vote::Abort),
            ..Script::prepared()
        }
    }

    /// Reply to `prepare`
    pub fn on_prepare(mut self, step: Step<Vote>) -> Self {
        self.prepare = step;
        self
    }

    /// Reply to `prepare_and_commit`
    ///
    /// Unset, it follows the `prepare` and `commit` steps.
    pub fn on_prepare_and_commit(mut self, step: Step<PrepareCommitOutcome>) -> Self {
        self.prepare_and_commit = Some(step);
        self
    }

    /// Reply to `commit`
    pub fn on_commit(mut self, step: Step<()>) -> Self {
        self.commit = step;
        self
    }

    /// Reply to `abort`
    pub fn on_abort(mut self, step: Step<()>) -> Self {
        self.abort = step;
        self
    }

    /// Park `prepare` and `prepare_and_commit` on `gate` until it opens
    pub fn hold_prepare(mut self, gate: Gate) -> Self {
        self.hold = Some(gate);
        self
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn combined(&self) -> Result<PrepareCommitOutcome, ParticipantError> {
        if let Some(step) = &self.prepare_and_commit {
            return step.run();
        }
        match self.prepare.run()? {
            Vote::Prepared => {
                self.commit.run()?;
                Ok(PrepareCommitOutcome::Committed)
            }
            Vote::Abort => Ok(PrepareCommitOutcome::Abort),
        }
    }
}

/// A call received by a [`ScriptedParticipant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// `prepare`
    Prepare,
    /// `prepare_and_commit`
    PrepareAndCommit,
    /// `commit`
    Commit,
    /// `abort`
    Abort,
}

/// Participant driven by a [`Script`]
pub struct ScriptedParticipant {
    name: String,
    script: Mutex<Script>,
    calls: Mutex<Vec<(TransactionId, Call)>>,
    committed_in_prepare: Mutex<Vec<TransactionId>>,
}

impl fmt::Debug for ScriptedParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedParticipant")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ScriptedParticipant {
    /// Create a participant following `script`
    pub fn new(name: impl Into<String>, script: Script) -> Arc<Self> {
        Arc::new(ScriptedParticipant {
            name: name.into(),
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            committed_in_prepare: Mutex::new(Vec::new()),
        })
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the script for subsequent calls
    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Calls received for `id`, in order
    pub fn calls(&self, id: TransactionId) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|(txn, _)| *txn == id)
            .map(|(_, call)| *call)
            .collect()
    }

    /// Every call received, in order
    pub fn all_calls(&self) -> Vec<(TransactionId, Call)> {
        self.calls.lock().clone()
    }

    /// How many times `call` was received for `id`
    pub fn count(&self, id: TransactionId, call: Call) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(txn, c)| *txn == id && *c == call)
            .count()
    }

    /// Terminal instructions received for `id`
    ///
    /// Counts `commit`, `abort`, and a `prepare_and_commit` that committed.
    pub fn terminal_calls(&self, id: TransactionId) -> usize {
        let in_prepare = self
            .committed_in_prepare
            .lock()
            .iter()
            .filter(|txn| **txn == id)
            .count();
        self.count(id, Call::Commit) + self.count(id, Call::Abort) + in_prepare
    }

    fn enter(&self, id: TransactionId, call: Call) -> Script {
        self.calls.lock().push((id, call));
        let script = self.script.lock().clone();
        if matches!(call, Call::Prepare | Call::PrepareAndCommit) {
            if let Some(gate) = &script.hold {
                gate.pass();
            }
        }
        if !script.latency.is_zero() {
            thread::sleep(script.latency);
        }
        script
    }
}

impl Participant for ScriptedParticipant {
    fn prepare(&self, id: TransactionId) -> Result<Vote, ParticipantError> {
        self.enter(id, Call::Prepare).prepare.run()
    }

    fn commit(&self, id: TransactionId) -> Result<(), ParticipantError> {
        self.enter(id, Call::Commit).commit.run()
    }

    fn abort(&self, id: TransactionId) -> Result<(), ParticipantError> {
        self.enter(id, Call::Abort).abort.run()
    }

    fn prepare_and_commit(&self, id: TransactionId) -> Result<PrepareCommitOutcome, ParticipantError> {
        let outcome = self.enter(id, Call::PrepareAndCommit).combined();
        if outcome == Ok(PrepareCommitOutcome::Committed) {
            self.committed_in_prepare.lock().push(id);
        }
        outcome
    }
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    parked: usize,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Barrier that parks callers until opened
///
/// Cloning shares the gate.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    /// A closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every parked caller; later callers pass straight through
    pub fn open(&self) {
        self.inner.state.lock().open = true;
        self.inner.changed.notify_all();
    }

    /// Whether the gate is open
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// Callers that have reached the gate so far
    pub fn parked(&self) -> usize {
        self.inner.state.lock().parked
    }

    /// Wait until `count` callers reached the gate; `false` on timeout
    pub fn wait_parked(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        while state.parked < count {
            match deadline {
                Some(deadline) => {
                    if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                        return state.parked >= count;
                    }
                }
                None => self.inner.changed.wait(&mut state),
            }
        }
        true
    }

    /// Arrive at the gate and block until it opens
    pub fn pass(&self) {
        let mut state = self.inner.state.lock();
        state.parked += 1;
        self.inner.changed.notify_all();
        while !state.open {
            self.inner.changed.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;

    #[test]
    fn test_script_records_calls() {
        let p = ScriptedParticipant::new("p", Script::prepared());
        let id = TransactionId::new(7);
        assert_eq!(p.prepare(id), Ok(Vote::Prepared));
        assert_eq!(p.commit(id), Ok(()));
        assert_eq!(p.calls(id), vec![Call::Prepare, Call::Commit]);
        assert_eq!(p.terminal_calls(id), 1);
        assert!(p.calls(TransactionId::new(8)).is_empty());

        p.abort(TransactionId::new(8)).unwrap();
        assert_eq!(
            p.all_calls(),
            vec![(id, Call::Prepare), (id, Call::Commit), (TransactionId::new(8), Call::Abort)]
        );
    }

    #[test]
    fn test_prepare_and_commit_follows_prepare_step() {
        let id = TransactionId::new(1);
        let refuses = ScriptedParticipant::new("no", Script::voting_abort());
        assert_eq!(refuses.prepare_and_commit(id), Ok(PrepareCommitOutcome::Abort));
        assert_eq!(refuses.terminal_calls(id), 0);

        let agrees = ScriptedParticipant::new("yes", Script::prepared());
        assert_eq!(agrees.prepare_and_commit(id), Ok(PrepareCommitOutcome::Committed));
        assert_eq!(agrees.calls(id), vec![Call::PrepareAndCommit]);
        assert_eq!(agrees.terminal_calls(id), 1);
    }

    #[test]
    fn test_failures_are_scripted() {
        let id = TransactionId::new(1);
        let p = ScriptedParticipant::new(
            "p",
            Script::prepared().on_abort(Step::Fail(ParticipantError::communication("down"))),
        );
        assert!(p.abort(id).unwrap_err().is_communication());

        p.set_script(Script::prepared().on_prepare(Step::Fail(ParticipantError::protocol("bad"))));
        assert!(p.prepare(id).unwrap_err().is_protocol());
    }

    #[test]
    fn test_gate_parks_until_open() {
        let gate = Gate::new();
        let p = ScriptedParticipant::new("p", Script::prepared().hold_prepare(gate.clone()));
        let handle = {
            let p = Arc::clone(&p);
            thread::spawn(move || p.prepare(TransactionId::new(1)))
        };
        assert!(gate.wait_parked(1, Duration::from_secs(5)));
        assert!(!gate.is_open());
        gate.open();
        assert_eq!(handle.join().unwrap(), Ok(Vote::Prepared));
        assert_eq!(gate.parked(), 1);
    }

    #[test]
    fn test_wait_parked_without_bound() {
        let gate = Gate::new();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_parked(1, Duration::MAX))
        };
        let passer = {
            let gate = gate.clone();
            thread::spawn(move || gate.pass())
        };
        assert!(waiter.join().unwrap());
        gate.open();
        passer.join().unwrap();
        assert!(gate.wait_parked(1, Duration::MAX));
    }

    #[test]
    fn test_crash_step_panics() {
        let p = ScriptedParticipant::new("p", Script::prepared().on_commit(Step::Crash("boom")));
        let id = TransactionId::new(1);
        let crashed = std::panic::catch_unwind(AssertUnwindSafe(|| p.commit(id)));
        assert!(crashed.is_err());
        assert_eq!(p.calls(id), vec![Call::Commit]);
    }

    #[test]
    fn test_wait_parked_times_out() {
        let gate = Gate::new();
        assert!(!gate.wait_parked(1, Duration::from_millis(10)));
    }
}
