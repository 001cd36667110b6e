//! Covenant - lease-based two-phase-commit transaction manager
//!
//! A transaction manager coordinates participants through two-phase commit.
//! Each transaction is held by a lease; a transaction whose lease expires or
//! is cancelled before a decision is aborted.
//!
//! # Quick Start
//!
//! ```ignore
//! use covenant::{LeaseDuration, ManagerConfig, TransactionManager};
//!
//! let manager = TransactionManager::new(ManagerConfig::default())?;
//! let created = manager.create(LeaseDuration::from_secs(60))?;
//! manager.join(created.transaction, participant)?;
//! let report = manager.commit(created.transaction)?;
//! ```
//!
//! # Architecture
//!
//! - `covenant-core`: ids, phases, errors, leases, the `Participant` trait
//! - `covenant-concurrency`: records, the participant registry, the coordinator
//! - `covenant-engine`: the manager facade, lease handles, the expiration sweeper

pub use covenant_concurrency::testing;
pub use covenant_concurrency::{CommitReport, RollForwardFailure, RollForwardPolicy};
pub use covenant_core::{
    AbortCause, Clock, Expiration, LeaseDuration, LeasePolicy, ManagerId, ManualClock, Outcome,
    Participant, ParticipantError, ParticipantRef, Phase, PrepareCommitOutcome, Result,
    SystemClock, Timestamp, TransactionId, TxnError, Vote,
};
pub use covenant_engine::{
    Created, Lease, ManagerConfig, SweepStats, TransactionManager, TransactionMetrics,
    CONFIG_FILE_NAME,
};
