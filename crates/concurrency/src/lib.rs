//! Concurrency layer for Covenant
//!
//! This crate implements the per-transaction protocol machinery:
//! - TransactionRecord: phase, participants, and lease under one lock
//! - ParticipantRegistry: join order and exactly-once terminal calls
//! - Coordinator: two-phase commit, roll-forward, and lease rules
//! - testing: scripted participants for protocol tests
//!
//! Records are independent. Operations on different transactions never
//! contend, and no participant call is made while a record lock is held.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod lease;
pub mod record;
pub mod registry;
pub mod testing;

pub use coordinator::{CommitReport, Coordinator, OutcomeCounts, RollForwardFailure, RollForwardPolicy};
pub use lease::{LeaseState, LeaseStatus};
pub use record::{RecordState, TransactionRecord};
pub use registry::{ParticipantRegistry, Progress, TerminalCall};
