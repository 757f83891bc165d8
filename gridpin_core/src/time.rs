//! Lease and expiry arithmetic.
//!
//! All durable timestamps are epoch milliseconds. A pin or request either
//! expires at a point in time or never does; leases arrive on the wire as
//! a positive number of seconds or `-1` for an infinite lease.

use chrono::Utc;
use minicbor::{Decode, Encode};
use std::fmt;
use std::time::Duration;

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Point in time at which a pin or pin request stops being honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Expiry {
    /// Never expires.
    #[n(0)]
    Never,
    /// Expires at the given epoch-millisecond instant.
    #[n(1)]
    At(#[n(0)] u64),
}

impl Expiry {
    /// True if `self` lasts at least as long as `other`.
    pub fn covers(&self, other: Expiry) -> bool {
        match (self, other) {
            (Expiry::Never, _) => true,
            (Expiry::At(_), Expiry::Never) => false,
            (Expiry::At(a), Expiry::At(b)) => *a >= b,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(t) => *t <= now,
        }
    }

    /// The later of two expiries.
    pub fn max(self, other: Expiry) -> Expiry {
        match (self, other) {
            (Expiry::Never, _) | (_, Expiry::Never) => Expiry::Never,
            (Expiry::At(a), Expiry::At(b)) => Expiry::At(a.max(b)),
        }
    }

    /// Expiry padded by a safety margin. Used for the pool-side marker,
    /// which must outlive the logical expiry even under clock drift.
    pub fn padded(&self, margin: Duration) -> Expiry {
        match self {
            Expiry::Never => Expiry::Never,
            Expiry::At(t) => Expiry::At(t.saturating_add(margin.as_millis() as u64)),
        }
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Never => f.write_str("never"),
            Expiry::At(t) => match chrono::DateTime::from_timestamp_millis(*t as i64) {
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "@{}ms", t),
            },
        }
    }
}

/// A client-requested pin duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    Infinite,
    Seconds(u64),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("lease must be a positive number of seconds or -1, got {0}")]
pub struct InvalidLease(pub i64);

impl Lease {
    /// Parses the wire encoding: positive seconds, or `-1` for infinite.
    pub fn from_raw(seconds: i64) -> Result<Self, InvalidLease> {
        match seconds {
            -1 => Ok(Lease::Infinite),
            s if s > 0 => Ok(Lease::Seconds(s as u64)),
            s => Err(InvalidLease(s)),
        }
    }

    /// Clamps the lease to a configured maximum, if any.
    pub fn capped(self, max: Option<Duration>) -> Lease {
        let Some(max) = max else { return self };
        let max_secs = max.as_secs();
        match self {
            Lease::Infinite => Lease::Seconds(max_secs),
            Lease::Seconds(s) => Lease::Seconds(s.min(max_secs)),
        }
    }

    /// Expiry this lease grants when taken out at `now`.
    pub fn expiry_from(&self, now: u64) -> Expiry {
        match self {
            Lease::Infinite => Expiry::Never,
            Lease::Seconds(s) => Expiry::At(now + s * 1000),
        }
    }
}
