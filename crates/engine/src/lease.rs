//! Client-side handles returned by `create`

use crate::manager::ManagerInner;
use covenant_core::{Expiration, LeaseDuration, ManagerId, Result, TransactionId, TxnError};
use std::fmt;
use std::sync::Weak;

/// Lease on one transaction
///
/// Holds only a weak reference to its manager. Once the manager is gone every
/// operation reports `UnknownLease`.
#[derive(Debug, Clone)]
pub struct Lease {
    id: TransactionId,
    expiration: Expiration,
    landlord: Weak<ManagerInner>,
}

impl Lease {
    pub(crate) fn new(id: TransactionId, expiration: Expiration, landlord: Weak<ManagerInner>) -> Self {
        Lease {
            id,
            expiration,
            landlord,
        }
    }

    /// Transaction this lease keeps alive
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Expiration as of the last grant or renewal through this handle
    pub fn expiration(&self) -> Expiration {
        self.expiration
    }

    /// Extend the lease from now
    pub fn renew(&mut self, duration: LeaseDuration) -> Result<Expiration> {
        let landlord = self.landlord.upgrade().ok_or(TxnError::UnknownLease(self.id))?;
        let expiration = landlord.renew(self.id, duration)?;
        self.expiration = expiration;
        Ok(expiration)
    }

    /// Cancel the lease, aborting the transaction if it is undecided
    pub fn cancel(&self) -> Result<()> {
        let landlord = self.landlord.upgrade().ok_or(TxnError::UnknownLease(self.id))?;
        landlord.cancel(self.id)
    }

    /// Whether the issuing manager still exists
    pub fn is_connected(&self) -> bool {
        self.landlord.strong_count() > 0
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expiration {
            Expiration::Never => write!(f, "lease on {} (no expiration)", self.id),
            Expiration::At(at) => write!(f, "lease on {} (expires {})", self.id, at),
        }
    }
}

/// A new transaction and its lease
#[derive(Debug, Clone)]
pub struct Created {
    /// Id of the new transaction
    pub transaction: TransactionId,
    /// Manager that owns it
    pub manager: ManagerId,
    /// Lease granted with it
    pub lease: Lease,
}

impl fmt::Display for Created {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on manager {} with {}", self.transaction, self.manager, self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_core::Timestamp;

    #[test]
    fn test_display_without_manager() {
        let lease = Lease::new(TransactionId::new(3), Expiration::Never, Weak::new());
        assert!(!lease.is_connected());
        assert_eq!(lease.to_string(), "lease on txn:3 (no expiration)");

        let created = Created {
            transaction: TransactionId::new(3),
            manager: ManagerId::new(),
            lease,
        };
        let shown = created.to_string();
        assert!(shown.starts_with("txn:3 on manager "));
        assert!(shown.ends_with("with lease on txn:3 (no expiration)"));
    }

    #[test]
    fn test_display_with_expiration() {
        let at = Timestamp::from_secs(0);
        let lease = Lease::new(TransactionId::new(1), Expiration::At(at), Weak::new());
        assert_eq!(lease.to_string(), format!("lease on txn:1 (expires {})", at));
    }

    #[test]
    fn test_orphaned_lease_is_unknown() {
        let mut lease = Lease::new(TransactionId::new(1), Expiration::Never, Weak::new());
        assert!(lease.renew(LeaseDuration::Any).unwrap_err().is_unknown_lease());
        assert!(lease.cancel().unwrap_err().is_unknown_lease());
        assert_eq!(lease.expiration(), Expiration::Never);
    }
}
