//! Pin and pin-request entities.

use crate::ids::{FileId, Owner, PinId, PoolName, RequestId, StickyMarker};
use crate::time::Expiry;
use minicbor::{Decode, Encode};
use std::fmt;

/// Lifecycle state of a [`Pin`].
///
/// `Initial → Pinning → Pinned → Unpinning → (row deleted)` is the happy
/// path; the remaining states are repair branches the sweeper drives back
/// into the main line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum PinState {
    /// Row reserved, no worker dispatched yet.
    #[n(0)]
    Initial,
    /// A pinner is installing the marker.
    #[n(1)]
    Pinning,
    /// Marker confirmed on the holding pool.
    #[n(2)]
    Pinned,
    /// An unpinner is removing the marker.
    #[n(3)]
    Unpinning,
    /// Marker removal could not be confirmed; retried by the sweeper.
    #[n(4)]
    UnpinningFailed,
    /// The pinned pool became unusable; a replacement pin is being
    /// established while requests stay attached here.
    #[n(5)]
    Repinning,
    /// A repin attempt failed; retried indefinitely by the sweeper.
    #[n(6)]
    Error,
    /// Expired before the pinner could confirm the marker.
    #[n(7)]
    Expired,
    /// Administrative relocation to another pool in progress.
    #[n(8)]
    Moving,
}

impl PinState {
    /// States that count against the one-active-pin-per-file invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, PinState::Initial | PinState::Pinning | PinState::Pinned)
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PinState::Initial => "INITIAL",
            PinState::Pinning => "PINNING",
            PinState::Pinned => "PINNED",
            PinState::Unpinning => "UNPINNING",
            PinState::UnpinningFailed => "UNPINNINGFAILED",
            PinState::Repinning => "REPINNING",
            PinState::Error => "ERROR",
            PinState::Expired => "EXPIRED",
            PinState::Moving => "MOVING",
        };
        f.write_str(s)
    }
}

/// One unique pin of a file: an eviction-exemption marker that exists
/// (or is being created) on exactly one pool.
///
/// A pin owns zero or more [`PinRequest`]s and is deleted only once it
/// has none and its marker removal (or failure) is durably recorded.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pin {
    #[n(0)]
    pub id: PinId,
    #[n(1)]
    pub file: FileId,
    /// Creation time, epoch millis.
    #[n(2)]
    pub created_at: u64,
    /// Logical expiry. While finite, always ≥ the max expiry among the
    /// pin's live requests.
    #[n(3)]
    pub expiry: Expiry,
    /// Holding pool; `None` until the pinner has selected one.
    #[n(4)]
    pub pool: Option<PoolName>,
    #[n(5)]
    pub state: PinState,
    /// Time of the last state transition, epoch millis.
    #[n(6)]
    pub state_changed_at: u64,
}

impl Pin {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// The marker this pin owns on its pool.
    pub fn marker(&self) -> StickyMarker {
        StickyMarker::for_pin(self.id)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pin {} file={} state={} pool={} expires={}",
            self.id,
            self.file,
            self.state,
            self.pool.as_ref().map(|p| p.as_str()).unwrap_or("-"),
            self.expiry,
        )
    }
}

/// One client lease on a [`Pin`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PinRequest {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub pin_id: PinId,
    /// Creation time, epoch millis.
    #[n(2)]
    pub created_at: u64,
    /// Expiry of this lease, independent of the pin's.
    #[n(3)]
    pub expiry: Expiry,
    /// Client-supplied idempotency token: a repeated request with the
    /// same correlation id for the same file reuses this lease.
    #[n(4)]
    pub correlation_id: Option<u64>,
    #[n(5)]
    pub owner: Option<Owner>,
}

impl fmt::Display for PinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request {} pin={} owner={} expires={}",
            self.id,
            self.pin_id,
            self.owner.as_ref().map(|o| o.as_str()).unwrap_or("-"),
            self.expiry,
        )
    }
}
