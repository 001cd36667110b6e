//! Lease state attached to a transaction record
//!
//! Mutated only under the owning record's lock: by renew, cancel, and the
//! expiration sweep.

use covenant_core::{Expiration, LeaseDuration, LeasePolicy, Timestamp};
use std::time::Duration;

/// Lifecycle of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Renewable until its expiration passes
    Valid,
    /// Cancelled by its holder; permanently invalid
    Cancelled,
    /// Expired; permanently invalid
    Expired,
}

/// Expiration and status of one transaction's lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    expiration: Expiration,
    granted: Option<Duration>,
    status: LeaseStatus,
}

impl LeaseState {
    /// Grant a new lease at `now`
    pub fn grant(policy: &LeasePolicy, requested: LeaseDuration, now: Timestamp) -> Self {
        let granted = policy.grant(requested);
        LeaseState {
            expiration: Expiration::after(now, granted),
            granted,
            status: LeaseStatus::Valid,
        }
    }

    /// Current expiration
    pub fn expiration(&self) -> Expiration {
        self.expiration
    }

    /// Length of the most recent grant (`None` = forever)
    pub fn granted(&self) -> Option<Duration> {
        self.granted
    }

    /// Current status
    pub fn status(&self) -> LeaseStatus {
        self.status
    }

    /// Valid and not past its expiration
    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.status == LeaseStatus::Valid && !self.expiration.has_passed(now)
    }

    /// Still marked valid but past its expiration
    pub fn has_lapsed(&self, now: Timestamp) -> bool {
        self.status == LeaseStatus::Valid && self.expiration.has_passed(now)
    }

    /// Extend from `now`; `None` if the lease is no longer valid
    pub fn renew(
        &mut self,
        policy: &LeasePolicy,
        requested: LeaseDuration,
        now: Timestamp,
    ) -> Option<Expiration> {
        if !self.is_valid(now) {
            return None;
        }
        self.granted = policy.grant(requested);
        self.expiration = Expiration::after(now, self.granted);
        Some(self.expiration)
    }

    /// Cancel; `false` if the lease was already invalid at `now`
    pub fn cancel(&mut self, now: Timestamp) -> bool {
        if !self.is_valid(now) {
            return false;
        }
        self.status = LeaseStatus::Cancelled;
        true
    }

    /// Record that the lease expired
    pub fn mark_expired(&mut self) {
        if self.status == LeaseStatus::Valid {
            self.status = LeaseStatus::Expired;
        }
    }
}
