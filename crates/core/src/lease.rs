//! Lease durations, expirations, and the grant policy
//!
//! A transaction's lease bounds how long it may stay undecided. The grantor
//! may shorten a request (clipping) but never lengthens it.

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Requested lease length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseDuration {
    /// No expiration
    Forever,
    /// Let the grantor choose
    Any,
    /// At most this long
    Bounded(Duration),
}

impl LeaseDuration {
    /// Bounded request of `millis` milliseconds
    pub fn from_millis(millis: u64) -> Self {
        LeaseDuration::Bounded(Duration::from_millis(millis))
    }

    /// Bounded request of `secs` seconds
    pub fn from_secs(secs: u64) -> Self {
        LeaseDuration::Bounded(Duration::from_secs(secs))
    }
}

impl From<Duration> for LeaseDuration {
    fn from(duration: Duration) -> Self {
        LeaseDuration::Bounded(duration)
    }
}

/// Absolute end of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expiration {
    /// The lease never expires on its own
    Never,
    /// The lease is valid up to and including this instant
    At(Timestamp),
}

impl Expiration {
    /// Expiration of a grant of `granted` starting at `now` (`None` = forever)
    pub fn after(now: Timestamp, granted: Option<Duration>) -> Self {
        match granted {
            Some(duration) => Expiration::At(now.saturating_add(duration)),
            None => Expiration::Never,
        }
    }

    /// Whether `now` is past this expiration
    pub fn has_passed(&self, now: Timestamp) -> bool {
        match self {
            Expiration::Never => false,
            Expiration::At(at) => now > *at,
        }
    }

    /// Time left at `now`; `None` for a lease that never expires
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        match self {
            Expiration::Never => None,
            Expiration::At(at) => Some(at.duration_since(now).unwrap_or_default()),
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiration::Never => f.write_str("never"),
            Expiration::At(at) => write!(f, "{}", at),
        }
    }
}

/// How requests are turned into grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Grant for `LeaseDuration::Any`
    pub default_duration: Duration,
    /// Upper bound on every grant; `None` allows `Forever`
    pub max_duration: Option<Duration>,
}

impl LeasePolicy {
    /// Granted duration for `requested` (`None` = forever)
    pub fn grant(&self, requested: LeaseDuration) -> Option<Duration> {
        let wanted = match requested {
            LeaseDuration::Forever => None,
            LeaseDuration::Any => Some(self.default_duration),
            LeaseDuration::Bounded(duration) => Some(duration),
        };
        match (wanted, self.max_duration) {
            (None, max) => max,
            (Some(duration), Some(max)) => Some(duration.min(max)),
            (Some(duration), None) => Some(duration),
        }
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy {
            default_duration: Duration::from_secs(60 * 60),
            max_duration: None,
        }
    }
}
