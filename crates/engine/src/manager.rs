//! Transaction manager
//!
//! The public face of the coordinator: creates transactions, resolves ids to
//! records, and forwards each operation to the [`Coordinator`].
//!
//! ## Transaction Table
//!
//! Records live in a `DashMap<TransactionId, Arc<TransactionRecord>>`. Every
//! operation clones the record's `Arc` out of the map before locking the
//! record, so the map's shard locks are never held across a record lock or
//! a participant call, and different transactions never block each other.
//!
//! Settled records stay queryable for `retention_ms`, then a sweep evicts
//! them and their ids become unknown.

use crate::config::{ManagerConfig, CONFIG_FILE_NAME};
use crate::lease::{Created, Lease};
use crate::sweeper::ExpirationSweeper;
use covenant_concurrency::{CommitReport, Coordinator, TransactionRecord};
use covenant_core::{
    Clock, Expiration, LeaseDuration, ManagerId, ParticipantRef, Phase, Result, SystemClock,
    TransactionId, TxnError,
};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one expiration sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Undecided transactions aborted because their lease lapsed
    pub expired: usize,
    /// Settled records removed from the table
    pub evicted: usize,
}

/// Shared state behind a [`TransactionManager`] and its leases
pub(crate) struct ManagerInner {
    id: ManagerId,
    table: DashMap<TransactionId, Arc<TransactionRecord>>,
    next_id: AtomicU64,
    total_created: AtomicU64,
    total_evicted: AtomicU64,
    coordinator: Coordinator,
    config: ManagerConfig,
}

impl ManagerInner {
    fn record(&self, id: TransactionId) -> Result<Arc<TransactionRecord>> {
        self.table
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TxnError::UnknownTransaction(id))
    }

    // Lease operations on an unknown id are lease errors, not transaction errors.
    fn leased_record(&self, id: TransactionId) -> Result<Arc<TransactionRecord>> {
        self.record(id).map_err(|_| TxnError::UnknownLease(id))
    }

    pub(crate) fn renew(&self, id: TransactionId, duration: LeaseDuration) -> Result<Expiration> {
        let record = self.leased_record(id)?;
        self.coordinator.renew(&record, duration)
    }

    pub(crate) fn cancel(&self, id: TransactionId) -> Result<()> {
        let record = self.leased_record(id)?;
        self.coordinator.cancel(&record)
    }

    pub(crate) fn sweep(&self) -> SweepStats {
        let now = self.coordinator.now();
        let retention = self.config.retention();
        let records: Vec<Arc<TransactionRecord>> = self
            .table
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut stats = SweepStats::default();
        for record in records {
            if self.coordinator.expire(&record) {
                stats.expired += 1;
                continue;
            }
            if self
                .table
                .remove_if(&record.id(), |_, r| r.is_evictable(now, retention))
                .is_some()
            {
                debug!(target: "covenant::sweep", txn = %record.id(), "Evicted settled transaction");
                stats.evicted += 1;
            }
        }

        self.total_evicted
            .fetch_add(stats.evicted as u64, Ordering::Relaxed);
        if stats != SweepStats::default() {
            debug!(
                target: "covenant::sweep",
                expired = stats.expired,
                evicted = stats.evicted,
                remaining = self.table.len(),
                "Sweep finished"
            );
        }
        stats
    }
}

/// Transaction manager
///
/// Creates transactions and runs two-phase commit over their participants.
/// All methods take `&self` and are safe to call from many threads.
pub struct TransactionManager {
    // Declared first so the sweeper is stopped and joined before `inner` drops
    _sweeper: Option<ExpirationSweeper>,
    inner: Arc<ManagerInner>,
}

impl TransactionManager {
    /// Create a manager on the system clock
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid config, or `Io` if the sweeper
    /// thread cannot be started.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager reading time from `clock`
    pub fn with_clock(config: ManagerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let coordinator = Coordinator::new(config.lease_policy(), config.roll_forward_policy(), clock);
        let inner = Arc::new(ManagerInner {
            id: ManagerId::new(),
            table: DashMap::new(),
            next_id: AtomicU64::new(1),
            total_created: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
            coordinator,
            config,
        });

        let sweeper = match inner.config.sweep_interval() {
            Some(interval) => Some(ExpirationSweeper::spawn(Arc::downgrade(&inner), interval)?),
            None => None,
        };

        info!(
            target: "covenant::txn",
            manager = %inner.id,
            sweep_interval_ms = inner.config.sweep_interval_ms,
            "Transaction manager started"
        );

        Ok(TransactionManager {
            _sweeper: sweeper,
            inner,
        })
    }

    /// Create a manager configured from `covenant.toml` in `dir`
    ///
    /// Writes the default file first if there is none.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        ManagerConfig::write_default_if_missing(&path)?;
        Self::new(ManagerConfig::from_file(&path)?)
    }

    /// Identity of this manager
    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    // ========================================================================
    // Transaction Operations
    // ========================================================================

    /// Create an ACTIVE transaction holding a lease of `duration`
    ///
    /// The granted lease may be shorter than requested.
    pub fn create(&self, duration: LeaseDuration) -> Result<Created> {
        let id = TransactionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(self.inner.coordinator.new_record(id, duration));
        let expiration = record.lease_expiration();
        self.inner.table.insert(id, record);
        self.inner.total_created.fetch_add(1, Ordering::Relaxed);

        info!(target: "covenant::txn", txn = %id, expiration = %expiration, "Transaction created");

        Ok(Created {
            transaction: id,
            manager: self.inner.id,
            lease: Lease::new(id, expiration, Arc::downgrade(&self.inner)),
        })
    }

    /// Enlist `participant`; returns its position in join order
    pub fn join(&self, id: TransactionId, participant: ParticipantRef) -> Result<usize> {
        let record = self.inner.record(id)?;
        self.inner.coordinator.join(&record, participant)
    }

    /// Run two-phase commit
    ///
    /// # Returns
    /// - Ok(CommitReport): COMMITTED; the report lists participants that
    ///   could not be rolled forward
    /// - Err(CannotCommit): ABORTED, with the cause
    pub fn commit(&self, id: TransactionId) -> Result<CommitReport> {
        let record = self.inner.record(id)?;
        self.inner.coordinator.commit(&record)
    }

    /// Abort; a no-op on an aborted transaction
    pub fn abort(&self, id: TransactionId) -> Result<()> {
        let record = self.inner.record(id)?;
        self.inner.coordinator.abort(&record)
    }

    /// Current phase
    ///
    /// A transaction whose lease lapsed is aborted before its phase is read.
    pub fn get_state(&self, id: TransactionId) -> Result<Phase> {
        let record = self.inner.record(id)?;
        self.inner.coordinator.expire(&record);
        Ok(record.phase())
    }

    /// Block until the transaction reaches `target` or settles
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if neither happens within `timeout`.
    pub fn wait_for_phase(&self, id: TransactionId, target: Phase, timeout: Duration) -> Result<Phase> {
        let record = self.inner.record(id)?;
        record
            .wait_for_phase(target, Some(timeout))
            .ok_or(TxnError::Timeout { id, waited: timeout })
    }

    /// Roll-forward report of a committed transaction
    pub fn commit_report(&self, id: TransactionId) -> Result<Option<CommitReport>> {
        Ok(self.inner.record(id)?.commit_report())
    }

    // ========================================================================
    // Lease Operations
    // ========================================================================

    /// Extend the transaction's lease from now
    pub fn renew(&self, id: TransactionId, duration: LeaseDuration) -> Result<Expiration> {
        self.inner.renew(id, duration)
    }

    /// Cancel the transaction's lease, aborting it if undecided
    pub fn cancel(&self, id: TransactionId) -> Result<()> {
        self.inner.cancel(id)
    }

    /// Expire lapsed leases and evict settled records past retention
    pub fn sweep(&self) -> SweepStats {
        self.inner.sweep()
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Snapshot of transaction statistics
    pub fn metrics(&self) -> TransactionMetrics {
        let counts = self.inner.coordinator.outcome_counts();
        TransactionMetrics {
            active_count: self.active_count() as u64,
            tracked: self.inner.table.len() as u64,
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_committed: counts.committed,
            total_aborted: counts.aborted,
            total_expired: counts.expired,
            total_evicted: self.inner.total_evicted.load(Ordering::Relaxed),
            roll_forward_failures: counts.roll_forward_failures,
        }
    }

    /// Transactions not yet decided
    pub fn active_count(&self) -> usize {
        self.inner
            .table
            .iter()
            .filter(|entry| !entry.value().phase().is_terminal())
            .count()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.inner.id)
            .field("tracked", &self.inner.table.len())
            .finish_non_exhaustive()
    }
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetrics {
    /// Transactions ACTIVE or VOTING
    pub active_count: u64,
    /// Records currently in the table, settled ones included
    pub tracked: u64,
    /// Total number of transactions created
    pub total_created: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions aborted, expiries included
    pub total_aborted: u64,
    /// Aborts caused by lease expiry
    pub total_expired: u64,
    /// Settled records evicted by sweeps
    pub total_evicted: u64,
    /// Commit calls that failed after a COMMITTED decision
    pub roll_forward_failures: u64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / created)
    pub fn abort_rate(&self) -> f64 {
        if self.total_created > 0 {
            self.total_aborted as f64 / self.total_created as f64
        } else {
            0.0
        }
    }
}
