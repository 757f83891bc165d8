//! Installs the sticky marker for a new pin.
//!
//! Protocol: fetch file attributes from the namespace, ask the pool
//! manager for a read pool (staging only when the requester may trigger
//! it), install the marker on the chosen pool with the safety margin
//! applied, then report pool and logical expiry back.

use crate::coordinator::PinCoordinator;
use crate::workers::step;
use gridpin_core::{
    Expiry, FileAttributes, FileId, PinId, PoolName, RemoteError, Staging, StickyMarker,
};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PinnerSpec {
    pub file: FileId,
    pub pin_id: PinId,
    /// Logical expiry to achieve; the pool-side marker gets this plus
    /// the safety margin.
    pub target: Expiry,
    pub staging: Staging,
}

#[derive(Debug)]
pub(crate) enum Step {
    FetchAttributes,
    SelectPool { attrs: FileAttributes },
    SetMarker { pool: PoolName },
}

#[derive(Debug)]
pub(crate) enum Event {
    Attributes(FileAttributes),
    Pool(PoolName),
    MarkerSet,
    Failed(RemoteError),
}

#[derive(Debug)]
pub(crate) enum Transition {
    Next(Step),
    Succeed { pool: PoolName },
    Fail(RemoteError),
}

pub(crate) fn advance(step: Step, event: Event) -> Transition {
    match (step, event) {
        (Step::FetchAttributes, Event::Attributes(attrs)) => {
            Transition::Next(Step::SelectPool { attrs })
        }
        (Step::SelectPool { .. }, Event::Pool(pool)) => Transition::Next(Step::SetMarker { pool }),
        (Step::SetMarker { pool }, Event::MarkerSet) => Transition::Succeed { pool },
        (_, Event::Failed(e)) => Transition::Fail(e),
        (step, event) => Transition::Fail(RemoteError::Failed(format!(
            "protocol violation: {event:?} in {step:?}"
        ))),
    }
}

pub(crate) async fn run(coordinator: Arc<PinCoordinator>, spec: PinnerSpec) {
    let marker = StickyMarker::for_pin(spec.pin_id);
    let marker_expiry = spec.target.padded(coordinator.sticky_margin);
    let timeout = coordinator.remote_timeout;

    let mut current = Step::FetchAttributes;
    loop {
        let event = match &current {
            Step::FetchAttributes => {
                match step(timeout, coordinator.namespace.file_attributes(&spec.file)).await {
                    Ok(attrs) => Event::Attributes(attrs),
                    Err(e) => Event::Failed(e),
                }
            }
            Step::SelectPool { attrs } => {
                match step(
                    timeout,
                    coordinator.pool_manager.select_read_pool(attrs, spec.staging),
                )
                .await
                {
                    Ok(pool) => Event::Pool(pool),
                    Err(e) => Event::Failed(e),
                }
            }
            Step::SetMarker { pool } => {
                match step(
                    timeout,
                    coordinator
                        .pools
                        .set_sticky(pool, &spec.file, &marker, marker_expiry, true),
                )
                .await
                {
                    Ok(()) => Event::MarkerSet,
                    Err(e) => Event::Failed(e),
                }
            }
        };

        match advance(current, event) {
            Transition::Next(next) => current = next,
            Transition::Succeed { pool } => {
                debug!(pin = %spec.pin_id, %pool, "marker installed");
                coordinator
                    .pin_succeeded(&spec.file, spec.pin_id, pool, spec.target)
                    .await;
                return;
            }
            Transition::Fail(reason) => {
                coordinator.pin_failed(&spec.file, spec.pin_id, &reason).await;
                return;
            }
        }
    }
}
