//! Transaction manager engine for Covenant
//!
//! This crate is the service layer over the coordinator:
//! - TransactionManager: create, join, commit, abort, state queries
//! - Lease handles and lease renewal/cancellation
//! - Background expiration sweep and eviction of settled transactions
//! - Configuration from `covenant.toml`
//! - Transaction metrics
//!
//! The engine owns the transaction table. Protocol decisions belong to
//! `covenant-concurrency`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod lease;
pub mod manager;
mod sweeper;

pub use config::{ManagerConfig, CONFIG_FILE_NAME};
pub use lease::{Created, Lease};
pub use manager::{SweepStats, TransactionManager, TransactionMetrics};
