//! Re-sets an existing marker with a later expiry.
//!
//! One remote step, so the whole state machine is the single
//! install-or-fail exchange with the holding pool.

use crate::coordinator::PinCoordinator;
use crate::workers::step;
use gridpin_core::{Expiry, FileId, PinId, PoolName, RequestId, StickyMarker};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ExtenderSpec {
    pub file: FileId,
    pub pin_id: PinId,
    /// The request whose lease forced the extension; `None` when the
    /// coordinator stretches a marker on its own behalf.
    pub request_id: Option<RequestId>,
    pub pool: PoolName,
    /// New logical expiry of the request driving the extension.
    pub request_expiry: Expiry,
    /// New logical expiry of the pin; the marker gets this plus the
    /// safety margin.
    pub target: Expiry,
}

pub(crate) async fn run(coordinator: Arc<PinCoordinator>, spec: ExtenderSpec) {
    let marker = StickyMarker::for_pin(spec.pin_id);
    let marker_expiry = spec.target.padded(coordinator.sticky_margin);

    let outcome = step(
        coordinator.remote_timeout,
        coordinator
            .pools
            .set_sticky(&spec.pool, &spec.file, &marker, marker_expiry, true),
    )
    .await;

    match outcome {
        Ok(()) => {
            debug!(pin = %spec.pin_id, target = %spec.target, "marker extended");
            coordinator.extend_succeeded(&spec).await;
        }
        Err(reason) => {
            coordinator.extend_failed(&spec, &reason).await;
        }
    }
}
