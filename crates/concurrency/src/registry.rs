//! Participant registry
//!
//! The ordered, append-only set of participants that joined a transaction.
//! Each slot tracks where its participant is in the protocol so that a
//! participant sees `prepare` (or `prepare_and_commit`) at most once, and
//! then at most one terminal call, never while a prepare is outstanding.

use covenant_core::ParticipantRef;

/// Terminal call owed to (or already made on) a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCall {
    /// `commit` issued
    Commit,
    /// `abort` issued
    Abort,
    /// The participant committed inside `prepare_and_commit`
    CommittedInPrepare,
    /// The participant voted abort and rolled itself back
    SelfAborted,
}

/// Protocol progress of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Joined; nothing sent yet
    Joined,
    /// A `prepare` or `prepare_and_commit` call is outstanding
    Preparing,
    /// Voted prepared; waiting for the decision
    Prepared,
    /// Prepare failed; the participant's state is unknown
    Unresolved,
    /// No further calls will be made
    Settled(TerminalCall),
}

impl Progress {
    fn accepts_terminal(&self) -> bool {
        matches!(self, Progress::Joined | Progress::Prepared | Progress::Unresolved)
    }
}

#[derive(Debug)]
struct Slot {
    participant: ParticipantRef,
    progress: Progress,
}

/// Participants of one transaction, in join order
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    slots: Vec<Slot>,
    frozen: bool,
}

impl ParticipantRegistry {
    /// Create an empty, open registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a participant; `None` once frozen
    ///
    /// The same handle may be joined more than once; each join gets its own slot.
    pub fn join(&mut self, participant: ParticipantRef) -> Option<usize> {
        if self.frozen {
            return None;
        }
        self.slots.push(Slot {
            participant,
            progress: Progress::Joined,
        });
        Some(self.slots.len() - 1)
    }

    /// Stop accepting joins
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether joins are still accepted
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of joined participants
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nobody joined
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Progress of the participant at `index`
    pub fn progress(&self, index: usize) -> Option<Progress> {
        self.slots.get(index).map(|slot| slot.progress)
    }

    /// Positions that were sent `commit`, in join order
    pub fn committed(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.progress == Progress::Settled(TerminalCall::Commit))
            .map(|(index, _)| index)
    }

    /// Mark a prepare outstanding at `index` and hand out the participant
    ///
    /// Returns `None` unless the slot is still `Joined`.
    pub fn begin_prepare(&mut self, index: usize) -> Option<ParticipantRef> {
        let slot = self.slots.get_mut(index)?;
        if slot.progress != Progress::Joined {
            return None;
        }
        slot.progress = Progress::Preparing;
        Some(slot.participant.clone())
    }

    /// Record what the outstanding prepare at `index` came back with
    pub fn finish_prepare(&mut self, index: usize, progress: Progress) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.progress == Progress::Preparing {
                slot.progress = progress;
            }
        }
    }

    /// Claim the terminal call for `index`
    ///
    /// Succeeds once per slot, and never while its prepare is outstanding.
    pub fn claim(&mut self, index: usize, call: TerminalCall) -> Option<ParticipantRef> {
        let slot = self.slots.get_mut(index)?;
        if !slot.progress.accepts_terminal() {
            return None;
        }
        slot.progress = Progress::Settled(call);
        Some(slot.participant.clone())
    }

    /// Claim every slot that can take `call` right now, in join order
    pub fn claim_all(&mut self, call: TerminalCall) -> Vec<(usize, ParticipantRef)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.progress.accepts_terminal())
            .map(|(index, slot)| {
                slot.progress = Progress::Settled(call);
                (index, slot.participant.clone())
            })
            .collect()
    }

    /// Whether any prepare is outstanding
    pub fn has_outstanding_prepare(&self) -> bool {
        self.slots.iter().any(|slot| slot.progress == Progress::Preparing)
    }

    /// Whether every participant has settled
    pub fn is_settled(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| matches!(slot.progress, Progress::Settled(_)))
    }
}
