//! The reconciliation sweeper.
//!
//! A single periodic loop repairing pins left inconsistent by a crash
//! or a failed worker. Every pass re-locks and re-validates before
//! acting, so running concurrently with live traffic (or with a
//! still-in-flight worker from a previous cycle) dispatches nothing
//! twice. Retries happen on behalf of nobody: the original requester
//! already got a provisional answer, so outcomes here are only logged.

use crate::coordinator::{PinCoordinator, RequestError};
use gridpin_core::{Pin, PinRequest, PinState, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Sweeper {
    coordinator: Arc<PinCoordinator>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(coordinator: Arc<PinCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Startup drain: force-unpin pins a crash left mid-flight, then run
    /// one full cycle. Call before accepting new requests.
    pub async fn startup(&self) {
        match self.coordinator.store().incomplete_pins() {
            Ok(pins) => {
                for pin in pins {
                    if matches!(
                        pin.state,
                        PinState::Initial
                            | PinState::Pinning
                            | PinState::Moving
                            | PinState::Unpinning
                            | PinState::Repinning
                    ) {
                        if let Err(e) = self.coordinator.recover_incomplete(&pin).await {
                            error!(pin = %pin.id, "startup recovery failed: {e}");
                        }
                    }
                }
            }
            Err(e) => error!("startup inventory failed: {e}"),
        }
        self.run_once().await;
        info!("startup reconciliation complete");
    }

    /// Runs the periodic loop forever. Spawn on its own task.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// One reconciliation cycle: four idempotent passes.
    pub async fn run_once(&self) {
        let store = self.coordinator.store();
        let now = now_millis();

        // 1. Retry marker removals that could not be confirmed.
        match store.pins_in_state(PinState::UnpinningFailed) {
            Ok(pins) => {
                for pin in pins {
                    if let Err(e) = self.coordinator.retry_failed_unpinning(&pin).await {
                        warn!(pin = %pin.id, "unpin retry failed: {e}");
                    }
                }
            }
            Err(e) => error!("sweep query for failed unpinnings failed: {e}"),
        }

        // 2. Release every lease past its expiry.
        match store.expired_requests(now) {
            Ok(requests) => {
                for request in requests {
                    if let Err(e) = self.coordinator.expire_request(&request, now).await {
                        warn!(request = %request.id, "lease expiry failed: {e}");
                    }
                }
            }
            Err(e) => error!("sweep query for expired leases failed: {e}"),
        }

        // 3. Force-unpin expired pins nobody holds any more.
        match store.expired_orphan_pins(now) {
            Ok(pins) => {
                for pin in pins {
                    if let Err(e) = self.coordinator.expire_orphan(&pin, now).await {
                        warn!(pin = %pin.id, "orphan expiry failed: {e}");
                    }
                }
            }
            Err(e) => error!("sweep query for expired pins failed: {e}"),
        }

        // 4. Retry repinning for pins parked in Error.
        match store.pins_in_state(PinState::Error) {
            Ok(pins) => {
                for pin in pins {
                    match self.coordinator.repin(&pin.file, pin.id).await {
                        Ok(true) => debug!(pin = %pin.id, "repin restarted"),
                        Ok(false) => {}
                        Err(e) => warn!(pin = %pin.id, "repin restart failed: {e}"),
                    }
                }
            }
            Err(e) => error!("sweep query for error pins failed: {e}"),
        }
    }
}

impl PinCoordinator {
    /// Pass 1: dispatch a fresh unpinner for a pin whose marker removal
    /// previously failed. The lock and re-validation make this safe to
    /// race with an unpinner still in flight.
    pub(crate) async fn retry_failed_unpinning(
        self: &Arc<Self>,
        pin: &Pin,
    ) -> Result<(), RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(&pin.file).await?;
        let Some(current) = txn.pin_for_update(pin.id)? else {
            return Ok(());
        };
        if current.state != PinState::UnpinningFailed {
            return Ok(());
        }
        txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
        txn.commit()?;
        debug!(pin = %pin.id, "retrying marker removal");
        self.spawn_unpinner(&current);
        Ok(())
    }

    /// Pass 2: release one expired lease, force-unpinning the pin when
    /// it was the last one.
    pub(crate) async fn expire_request(
        self: &Arc<Self>,
        request: &PinRequest,
        now: u64,
    ) -> Result<(), RequestError> {
        let Some(pin) = self.store.pin_by_id(request.pin_id.0)? else {
            return Ok(());
        };
        let mut txn = self.store.begin(&pin.file).await?;
        let Some((pin, request)) = txn.pin_by_request(request.id)? else {
            return Ok(());
        };
        if !request.expiry.is_expired(now) {
            // Extended since the query ran.
            return Ok(());
        }

        info!(request = %request.id, file = %pin.file, "lease expired");
        if txn.requests_for_pin(pin.id)?.len() > 1 {
            txn.delete_request(request.id)?;
            txn.commit()?;
            return Ok(());
        }
        if pin.state == PinState::Unpinning {
            // An unpinner already owns this pin.
            return Ok(());
        }
        txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
        txn.commit()?;
        self.spawn_unpinner(&pin);
        Ok(())
    }

    /// Pass 3: deal with an expired pin that has no leases left. A pin
    /// still being established is marked `Expired` so a late pinner
    /// confirmation is refused; anything else loses its marker.
    pub(crate) async fn expire_orphan(self: &Arc<Self>, pin: &Pin, now: u64) -> Result<(), RequestError> {
        let mut txn = self.store.begin(&pin.file).await?;
        let Some(current) = txn.pin_for_update(pin.id)? else {
            return Ok(());
        };
        if !current.expiry.is_expired(now) || !txn.requests_for_pin(pin.id)?.is_empty() {
            return Ok(());
        }
        match current.state {
            PinState::Initial | PinState::Pinning => {
                txn.update_pin(pin.id, None, None, Some(PinState::Expired), now)?;
                txn.commit()?;
                info!(pin = %pin.id, "marked expired before pinning finished");
                Ok(())
            }
            PinState::Pinned
            | PinState::Expired
            | PinState::Error
            | PinState::Repinning
            | PinState::Moving => {
                txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
                txn.commit()?;
                info!(pin = %pin.id, "expired pin, removing marker");
                self.spawn_unpinner(&current);
                Ok(())
            }
            PinState::Unpinning | PinState::UnpinningFailed => Ok(()),
        }
    }

    /// Startup only: a crash left this pin mid-operation and no worker
    /// is alive to finish it; release it.
    pub(crate) async fn recover_incomplete(self: &Arc<Self>, pin: &Pin) -> Result<(), RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(&pin.file).await?;
        let Some(current) = txn.pin_for_update(pin.id)? else {
            return Ok(());
        };
        if current.state != pin.state {
            return Ok(());
        }
        for request in txn.requests_for_pin(pin.id)? {
            txn.delete_request(request.id)?;
        }
        txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
        txn.commit()?;
        warn!(pin = %pin.id, state = %pin.state, "recovering pin left over from a crash");
        self.spawn_unpinner(&current);
        Ok(())
    }
}
