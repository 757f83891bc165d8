//! Tracking of in-flight requests awaiting a worker outcome.
//!
//! Two maps, both keyed by pin-request id: callers waiting for a pin or
//! extend to complete, and callers waiting for an unpin. A worker
//! callback takes the waiters out of the map and resolves each exactly
//! once; an entry that was never parked resolves nobody and is not an
//! error.

use crate::coordinator::RequestError;
use dashmap::DashMap;
use gridpin_core::Expiry;
use tokio::sync::oneshot;

/// What kind of operation a pin-map waiter is blocked on. A failed
/// repin deletes the lease rows of waiting *pin* callers but keeps the
/// rows of *extend* callers, whose leases were confirmed long ago.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaiterKind {
    Pin,
    Extend,
}

pub(crate) struct PinWaiter {
    pub kind: WaiterKind,
    pub tx: oneshot::Sender<Result<Expiry, RequestError>>,
}

#[derive(Default)]
pub(crate) struct ReplyTracker {
    pin: DashMap<u64, Vec<PinWaiter>>,
    unpin: DashMap<u64, Vec<oneshot::Sender<Result<(), RequestError>>>>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park_pin(&self, request: u64, kind: WaiterKind) -> oneshot::Receiver<Result<Expiry, RequestError>> {
        let (tx, rx) = oneshot::channel();
        self.pin.entry(request).or_default().push(PinWaiter { kind, tx });
        rx
    }

    pub fn park_unpin(&self, request: u64) -> oneshot::Receiver<Result<(), RequestError>> {
        let (tx, rx) = oneshot::channel();
        self.unpin.entry(request).or_default().push(tx);
        rx
    }

    /// Removes and returns every pin/extend waiter parked under the
    /// request, leaving nothing behind.
    pub fn take_pin(&self, request: u64) -> Vec<PinWaiter> {
        self.pin.remove(&request).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn take_unpin(&self, request: u64) -> Vec<oneshot::Sender<Result<(), RequestError>>> {
        self.unpin.remove(&request).map(|(_, v)| v).unwrap_or_default()
    }

    /// Resolves every pin/extend waiter with the same result.
    pub fn resolve_pin(&self, request: u64, result: Result<Expiry, RequestError>) {
        for waiter in self.take_pin(request) {
            let _ = waiter.tx.send(result.clone());
        }
    }

    pub fn resolve_unpin(&self, request: u64, result: Result<(), RequestError>) {
        for tx in self.take_unpin(request) {
            let _ = tx.send(result.clone());
        }
    }
}
