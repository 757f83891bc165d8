//! Relocates a pin's marker to another pool.
//!
//! Installs a marker for the destination pin first, then hands control
//! to the coordinator to migrate the requests and flip the source pin to
//! `Unpinning`, and only then clears the source marker. The file is
//! never without a confirmed marker while the move is under way.

use crate::coordinator::{Handoff, PinCoordinator, RequestError};
use crate::workers::step;
use gridpin_core::{Expiry, FileId, PinId, PoolName, StickyMarker};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) struct MoverSpec {
    pub file: FileId,
    pub src_pin: PinId,
    pub dst_pin: PinId,
    pub target_pool: PoolName,
    pub expiry: Expiry,
    /// The administrative caller awaiting the outcome.
    pub reply: oneshot::Sender<Result<(), RequestError>>,
}

pub(crate) async fn run(coordinator: Arc<PinCoordinator>, spec: MoverSpec) {
    let MoverSpec {
        file,
        src_pin,
        dst_pin,
        target_pool,
        expiry,
        reply,
    } = spec;

    let dst_marker = StickyMarker::for_pin(dst_pin);
    let marker_expiry = expiry.padded(coordinator.sticky_margin);
    let timeout = coordinator.remote_timeout;

    // Step 1: establish the marker at the destination.
    if let Err(e) = step(
        timeout,
        coordinator
            .pools
            .set_sticky(&target_pool, &file, &dst_marker, marker_expiry, true),
    )
    .await
    {
        coordinator.move_install_failed(&file, dst_pin).await;
        let _ = reply.send(Err(RequestError::Failed(format!(
            "marker install at {target_pool} failed: {e}"
        ))));
        return;
    }

    // Step 2: hand over to the coordinator to migrate requests.
    let source_pool = match coordinator.move_marker_installed(&file, src_pin, dst_pin).await {
        Handoff::Proceed { source_pool } => source_pool,
        Handoff::Abort {
            outcome,
            clear_marker,
        } => {
            if clear_marker {
                // Best effort; an orphaned destination marker expires on
                // its own thanks to the marker lifetime.
                if let Err(e) = step(
                    timeout,
                    coordinator
                        .pools
                        .set_sticky(&target_pool, &file, &dst_marker, Expiry::Never, false),
                )
                .await
                {
                    warn!(pin = %dst_pin, "failed to clear abandoned destination marker: {e}");
                }
            }
            let _ = reply.send(outcome);
            return;
        }
    };

    // Step 3: the requests are safe at the destination; drop the source
    // marker.
    let src_marker = StickyMarker::for_pin(src_pin);
    match step(
        timeout,
        coordinator
            .pools
            .set_sticky(&source_pool, &file, &src_marker, Expiry::Never, false),
    )
    .await
    {
        Ok(()) => {
            debug!(src = %src_pin, dst = %dst_pin, "pin moved");
            coordinator.move_completed(&file, src_pin).await;
        }
        Err(e) => {
            // The move itself is complete; marker cleanup is retried by
            // the sweeper.
            warn!(pin = %src_pin, "source marker not cleared, deferring to sweeper: {e}");
            coordinator.move_source_clear_failed(&file, src_pin).await;
        }
    }
    let _ = reply.send(Ok(()));
}
