//! Worker-only callbacks.
//!
//! Each callback re-opens a file-scoped transaction, re-reads the pin
//! under the lock (its state may have changed while the worker was on
//! the wire), applies the outcome, and resolves every caller parked
//! under the pin's requests. Replies are flushed only after the commit
//! so a failed transaction never leaks a wrong answer.

use super::{PinCoordinator, RequestError};
use crate::tracker::WaiterKind;
use crate::workers::extender::ExtenderSpec;
use crate::workers::pinner::PinnerSpec;
use gridpin_core::{
    Expiry, FileId, PinId, PinState, PoolName, RemoteError, RequestId, Staging, now_millis,
};
use gridpin_store::Txn;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type PinReply = Result<Expiry, RequestError>;
type DirectReplies = Vec<(oneshot::Sender<PinReply>, PinReply)>;

/// Verdict the coordinator hands back to a mover after the marker is
/// installed at the destination.
pub(crate) enum Handoff {
    /// Requests migrated; clear the source pool's marker next.
    Proceed { source_pool: PoolName },
    /// The move is off. `clear_marker` asks the mover to remove the
    /// destination marker it just created.
    Abort {
        outcome: Result<(), RequestError>,
        clear_marker: bool,
    },
}

impl PinCoordinator {
    pub(crate) async fn pin_succeeded(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        pool: PoolName,
        achieved: Expiry,
    ) {
        if let Err(e) = self.apply_pin_succeeded(file, pin_id, pool, achieved).await {
            error!(pin = %pin_id, "pin-succeeded callback failed: {e}");
        }
    }

    async fn apply_pin_succeeded(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        pool: PoolName,
        achieved: Expiry,
    ) -> Result<(), RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(file).await?;
        let Some(pin) = txn.pin_for_update(pin_id)? else {
            debug!(pin = %pin_id, "pin vanished before its pinner reported back");
            return Ok(());
        };

        let refusal = match pin.state {
            PinState::Pinning | PinState::Initial | PinState::Pinned => None,
            PinState::Expired => Some("expired before pinning finished".to_owned()),
            PinState::Unpinning => Some("unpinning started".to_owned()),
            state => Some(format!("pin is {state} now")),
        };

        if let Some(reason) = refusal {
            // The marker is installed but nobody wants it any more.
            let mut direct = DirectReplies::new();
            let mut by_id = Vec::new();
            self.fail_repinning(&mut txn, file, pin_id, &reason, &mut direct, now)?;
            for request in txn.requests_for_pin(pin_id)? {
                by_id.push((
                    request.id.0,
                    Err(RequestError::Failed(format!("pinning failed: {reason}"))),
                ));
                txn.delete_request(request.id)?;
            }
            let dying = txn.update_pin(
                pin_id,
                None,
                Some(pool),
                Some(PinState::Unpinning),
                now,
            )?;
            txn.commit()?;
            self.flush(direct, by_id);
            info!(pin = %pin_id, %reason, "pin confirmation refused, removing marker");
            self.spawn_unpinner(&dying);
            return Ok(());
        }

        let mut by_id = Vec::new();
        let mut final_expiry = pin.expiry.max(achieved);
        for request in txn.requests_for_pin(pin_id)? {
            by_id.push((request.id.0, Ok(request.expiry)));
        }

        // Adopt leases stranded on repair pins of the same file; the
        // stripped pins keep their marker on the books until the
        // sweeper clears it.
        for stranded in txn.pins_for_file(file)? {
            if stranded.id == pin_id
                || !matches!(stranded.state, PinState::Repinning | PinState::Error)
            {
                continue;
            }
            for request in txn.requests_for_pin(stranded.id)? {
                txn.move_request(request.id, pin_id)?;
                final_expiry = final_expiry.max(request.expiry);
                by_id.push((request.id.0, Ok(request.expiry)));
            }
            txn.update_pin(stranded.id, None, None, Some(PinState::UnpinningFailed), now)?;
        }

        txn.update_pin(
            pin_id,
            Some(final_expiry),
            Some(pool.clone()),
            Some(PinState::Pinned),
            now,
        )?;

        let needs_stretch = !achieved.covers(final_expiry);
        txn.commit()?;
        self.flush(DirectReplies::new(), by_id);
        info!(pin = %pin_id, %pool, expiry = %final_expiry, "pinned");

        if needs_stretch {
            // Requests attached while the pinner was under way outlive
            // the marker it installed.
            self.spawn_extender(ExtenderSpec {
                file: file.clone(),
                pin_id,
                request_id: None,
                pool,
                request_expiry: final_expiry,
                target: final_expiry,
            });
        }
        Ok(())
    }

    pub(crate) async fn pin_failed(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        reason: &RemoteError,
    ) {
        if let Err(e) = self.apply_pin_failed(file, pin_id, reason).await {
            error!(pin = %pin_id, "pin-failed callback failed: {e}");
        }
    }

    async fn apply_pin_failed(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        reason: &RemoteError,
    ) -> Result<(), RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(file).await?;
        if txn.pin_for_update(pin_id)?.is_none() {
            return Ok(());
        }

        let mut direct = DirectReplies::new();
        let mut by_id = Vec::new();
        self.fail_repinning(&mut txn, file, pin_id, &reason.to_string(), &mut direct, now)?;

        // A failed pin deletes itself and fails every attached request;
        // no orphan rows remain.
        for request in txn.requests_for_pin(pin_id)? {
            by_id.push((
                request.id.0,
                Err(RequestError::Failed(format!("pinning failed: {reason}"))),
            ));
            txn.delete_request(request.id)?;
        }
        txn.delete_pin(pin_id)?;
        txn.commit()?;
        self.flush(direct, by_id);
        warn!(pin = %pin_id, %reason, "pinning failed, pin deleted");
        Ok(())
    }

    /// Fails every repin attempt under way for the file: waiting callers
    /// are answered, pending pin leases are dropped, confirmed leases
    /// survive, and the stripped pins park in `Error` for the sweeper's
    /// indefinite retry.
    fn fail_repinning(
        &self,
        txn: &mut Txn,
        file: &FileId,
        exclude: PinId,
        reason: &str,
        direct: &mut DirectReplies,
        now: u64,
    ) -> Result<(), RequestError> {
        for pin in txn.pins_for_file(file)? {
            if pin.id == exclude || pin.state != PinState::Repinning {
                continue;
            }
            for request in txn.requests_for_pin(pin.id)? {
                let waiters = self.pending.take_pin(request.id.0);
                let mut drop_row = false;
                for waiter in waiters {
                    if waiter.kind == WaiterKind::Pin {
                        drop_row = true;
                    }
                    direct.push((
                        waiter.tx,
                        Err(RequestError::Failed(format!(
                            "original pinned copy is unavailable and repinning failed: {reason}"
                        ))),
                    ));
                }
                if drop_row {
                    txn.delete_request(request.id)?;
                }
            }
            txn.update_pin(pin.id, None, None, Some(PinState::Error), now)?;
        }
        Ok(())
    }

    pub(crate) async fn extend_succeeded(self: &Arc<Self>, spec: &ExtenderSpec) {
        let Some(request_id) = spec.request_id else {
            debug!(pin = %spec.pin_id, "marker stretched");
            return;
        };
        match self.apply_extend_succeeded(spec, request_id).await {
            Ok(reply) => self.pending.resolve_pin(request_id.0, reply),
            Err(e) => {
                error!(pin = %spec.pin_id, "extend-succeeded callback failed: {e}");
                self.pending.resolve_pin(request_id.0, Err(e));
            }
        }
    }

    async fn apply_extend_succeeded(
        self: &Arc<Self>,
        spec: &ExtenderSpec,
        request_id: RequestId,
    ) -> Result<PinReply, RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(&spec.file).await?;
        let Some(pin) = txn.pin_for_update(spec.pin_id)? else {
            return Ok(Err(RequestError::NotFound(format!(
                "pin {} vanished during the extension",
                spec.pin_id
            ))));
        };
        if !matches!(
            pin.state,
            PinState::Pinned | PinState::Pinning | PinState::Initial
        ) {
            return Ok(Err(RequestError::NotPinned(format!(
                "pin request {request_id} is not pinned anymore"
            ))));
        }
        match txn.pin_by_request(request_id)? {
            Some((owner, _)) if owner.id == spec.pin_id => {}
            _ => {
                return Ok(Err(RequestError::NotFound(format!(
                    "pin request {request_id} disappeared during the extension"
                ))));
            }
        }
        txn.update_request_expiry(request_id, spec.request_expiry)?;
        txn.update_pin(spec.pin_id, Some(pin.expiry.max(spec.target)), None, None, now)?;
        txn.commit()?;
        debug!(request = %request_id, expiry = %spec.request_expiry, "lease extended");
        Ok(Ok(spec.request_expiry))
    }

    /// A failed extend is not surfaced to the caller: the marker (or
    /// its pool) is presumed bad, so a repin is attempted and the
    /// parked caller resolves with the repin's outcome.
    pub(crate) async fn extend_failed(self: &Arc<Self>, spec: &ExtenderSpec, reason: &RemoteError) {
        warn!(pin = %spec.pin_id, %reason, "extend failed, attempting repin");
        let extension = spec.request_id.map(|rid| (rid, spec.request_expiry));
        match self
            .repin_with_extension(&spec.file, spec.pin_id, extension)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if let Some(rid) = spec.request_id {
                    self.pending.resolve_pin(
                        rid.0,
                        Err(RequestError::NotPinned(format!(
                            "pin request {rid} is not pinned anymore"
                        ))),
                    );
                }
            }
            Err(e) => {
                error!(pin = %spec.pin_id, "repin after failed extend did not start: {e}");
                if let Some(rid) = spec.request_id {
                    self.pending.resolve_pin(rid.0, Err(e));
                }
            }
        }
    }

    pub(crate) async fn repin(self: &Arc<Self>, file: &FileId, pin_id: PinId) -> Result<bool, RequestError> {
        self.repin_with_extension(file, pin_id, None).await
    }

    /// Re-establishes the marker of a `Pinned` or `Error` pin at a
    /// freshly selected pool. The requests stay on the old pin until
    /// the replacement confirms. Returns false when the pin is no
    /// longer eligible.
    async fn repin_with_extension(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        extension: Option<(RequestId, Expiry)>,
    ) -> Result<bool, RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(file).await?;
        let Some(old) = txn.pin_for_update(pin_id)? else {
            return Ok(false);
        };
        if !matches!(old.state, PinState::Pinned | PinState::Error) {
            return Ok(false);
        }

        let mut target = old.expiry;
        if let Some((request_id, expiry)) = extension {
            // Record the lease the failed extend was carrying, so the
            // replacement marker covers it.
            if let Some((owner, _)) = txn.pin_by_request(request_id)?
                && owner.id == pin_id
            {
                txn.update_request_expiry(request_id, expiry)?;
                target = target.max(expiry);
            }
        }

        txn.update_pin(pin_id, Some(target), None, Some(PinState::Repinning), now)?;
        let fresh = txn.insert_pin(file, target, None, PinState::Pinning, now)?;
        txn.commit()?;
        info!(%file, old = %pin_id, new = %fresh.id, "repinning");
        self.spawn_pinner(PinnerSpec {
            file: file.clone(),
            pin_id: fresh.id,
            target,
            staging: Staging::Allowed,
        });
        Ok(true)
    }

    pub(crate) async fn unpin_succeeded(self: &Arc<Self>, file: &FileId, pin_id: PinId) {
        if let Err(e) = self.apply_unpin_done(file, pin_id, None).await {
            error!(pin = %pin_id, "unpin-succeeded callback failed: {e}");
        }
    }

    pub(crate) async fn unpin_failed(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        reason: &RemoteError,
    ) {
        if let Err(e) = self.apply_unpin_done(file, pin_id, Some(reason)).await {
            error!(pin = %pin_id, "unpin-failed callback failed: {e}");
        }
    }

    async fn apply_unpin_done(
        self: &Arc<Self>,
        file: &FileId,
        pin_id: PinId,
        failure: Option<&RemoteError>,
    ) -> Result<(), RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(file).await?;
        if txn.pin_for_update(pin_id)?.is_none() {
            return Ok(());
        }

        let mut pin_replies = Vec::new();
        let mut unpin_replies = Vec::new();
        for request in txn.requests_for_pin(pin_id)? {
            // A pin caller still parked here lost the race to an unpin.
            pin_replies.push((
                request.id.0,
                Err(RequestError::Failed(
                    "pinning failed, the pin was released".into(),
                )),
            ));
            unpin_replies.push((
                request.id.0,
                match failure {
                    None => Ok(()),
                    Some(reason) => Err(RequestError::Failed(format!(
                        "unpinning failed and will be retried: {reason}"
                    ))),
                },
            ));
            txn.delete_request(request.id)?;
        }

        match failure {
            None => {
                txn.delete_pin(pin_id)?;
            }
            Some(_) => {
                // Keep the row so the sweeper retries the marker
                // removal; the leases are gone either way.
                txn.update_pin(pin_id, None, None, Some(PinState::UnpinningFailed), now)?;
            }
        }
        txn.commit()?;

        for (id, reply) in pin_replies {
            self.pending.resolve_pin(id, reply);
        }
        for (id, reply) in unpin_replies {
            self.pending.resolve_unpin(id, reply);
        }
        match failure {
            None => info!(pin = %pin_id, "unpinned"),
            Some(reason) => warn!(pin = %pin_id, %reason, "unpinning failed, parked for retry"),
        }
        Ok(())
    }

    // --- Mover handoff ---

    pub(crate) async fn move_marker_installed(
        self: &Arc<Self>,
        file: &FileId,
        src_id: PinId,
        dst_id: PinId,
    ) -> Handoff {
        match self.apply_move_handoff(file, src_id, dst_id).await {
            Ok(handoff) => handoff,
            Err(e) => {
                error!(src = %src_id, dst = %dst_id, "move handoff failed: {e}");
                Handoff::Abort {
                    outcome: Err(e),
                    clear_marker: true,
                }
            }
        }
    }

    async fn apply_move_handoff(
        &self,
        file: &FileId,
        src_id: PinId,
        dst_id: PinId,
    ) -> Result<Handoff, RequestError> {
        let now = now_millis();
        let mut txn = self.store.begin(file).await?;

        let Some(src) = txn.pin_for_update(src_id)? else {
            // Nothing left to move; drop the destination again.
            txn.delete_pin(dst_id)?;
            txn.commit()?;
            return Ok(Handoff::Abort {
                outcome: Ok(()),
                clear_marker: true,
            });
        };
        if src.state != PinState::Pinned {
            txn.delete_pin(dst_id)?;
            txn.commit()?;
            return Ok(Handoff::Abort {
                outcome: Err(RequestError::Failed(format!(
                    "source pin became {} during the move",
                    src.state
                ))),
                clear_marker: true,
            });
        }
        let Some(dst) = txn.pin_for_update(dst_id)? else {
            return Ok(Handoff::Abort {
                outcome: Err(RequestError::Failed(
                    "destination pin vanished during the move".into(),
                )),
                clear_marker: true,
            });
        };
        if dst.state != PinState::Moving {
            return Ok(Handoff::Abort {
                outcome: Err(RequestError::Failed(format!(
                    "destination pin became {} during the move",
                    dst.state
                ))),
                clear_marker: false,
            });
        }
        let Some(source_pool) = src.pool.clone() else {
            txn.delete_pin(dst_id)?;
            txn.commit()?;
            return Ok(Handoff::Abort {
                outcome: Err(RequestError::Failed(format!(
                    "source pin {src_id} has no pool"
                ))),
                clear_marker: true,
            });
        };

        txn.update_pin(dst_id, None, None, Some(PinState::Pinned), now)?;
        for request in txn.requests_for_pin(src_id)? {
            txn.move_request(request.id, dst_id)?;
        }
        txn.update_pin(src_id, None, None, Some(PinState::Unpinning), now)?;
        txn.commit()?;
        info!(src = %src_id, dst = %dst_id, "requests migrated to destination pin");
        Ok(Handoff::Proceed { source_pool })
    }

    pub(crate) async fn move_install_failed(&self, file: &FileId, dst_id: PinId) {
        if let Err(e) = self.delete_pin_row(file, dst_id).await {
            error!(pin = %dst_id, "failed to discard destination pin: {e}");
        }
    }

    pub(crate) async fn move_completed(&self, file: &FileId, src_id: PinId) {
        if let Err(e) = self.delete_pin_row(file, src_id).await {
            error!(pin = %src_id, "failed to delete moved source pin: {e}");
        }
    }

    pub(crate) async fn move_source_clear_failed(&self, file: &FileId, src_id: PinId) {
        let result: Result<(), RequestError> = async {
            let now = now_millis();
            let mut txn = self.store.begin(file).await?;
            if let Some(pin) = txn.pin_for_update(src_id)?
                && pin.state == PinState::Unpinning
            {
                txn.update_pin(src_id, None, None, Some(PinState::UnpinningFailed), now)?;
                txn.commit()?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!(pin = %src_id, "failed to park source pin for cleanup: {e}");
        }
    }

    async fn delete_pin_row(&self, file: &FileId, pin_id: PinId) -> Result<(), RequestError> {
        let mut txn = self.store.begin(file).await?;
        txn.delete_pin(pin_id)?;
        txn.commit()?;
        Ok(())
    }

    fn flush(&self, direct: DirectReplies, by_id: Vec<(u64, PinReply)>) {
        for (tx, reply) in direct {
            let _ = tx.send(reply);
        }
        for (id, reply) in by_id {
            self.pending.resolve_pin(id, reply);
        }
    }
}
