//! Clears the sticky marker(s) of a pin being released.
//!
//! The pool to clean is known for pins that completed pool selection;
//! otherwise every cache location reported by the namespace is cleaned.
//! Pre-migration pins may also carry a namespace-level flag, cleared
//! first. A file that no longer exists anywhere counts as successfully
//! unpinned.

use crate::coordinator::PinCoordinator;
use crate::workers::step;
use gridpin_core::{FileId, PinId, PoolName, RemoteError, StickyMarker};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct UnpinnerSpec {
    pub file: FileId,
    pub pin_id: PinId,
    /// Holding pool, when the pin got far enough to know one.
    pub pool: Option<PoolName>,
}

#[derive(Debug)]
pub(crate) enum Step {
    ResolveLocations,
    ClearLegacyFlag { pools: VecDeque<PoolName> },
    ClearMarker { pools: VecDeque<PoolName> },
}

#[derive(Debug)]
pub(crate) enum Event {
    Locations(Vec<PoolName>),
    LegacyCleared,
    MarkerCleared,
    /// The file is gone from the fabric; nothing left to clean.
    FileGone,
    Failed(RemoteError),
}

#[derive(Debug)]
pub(crate) enum Transition {
    Next(Step),
    Succeed,
    Fail(RemoteError),
}

pub(crate) fn advance(step: Step, event: Event) -> Transition {
    match (step, event) {
        (Step::ResolveLocations, Event::Locations(pools)) => {
            Transition::Next(Step::ClearLegacyFlag {
                pools: pools.into(),
            })
        }
        (_, Event::FileGone) => Transition::Succeed,
        (Step::ClearLegacyFlag { pools }, Event::LegacyCleared) => {
            if pools.is_empty() {
                Transition::Succeed
            } else {
                Transition::Next(Step::ClearMarker { pools })
            }
        }
        (Step::ClearMarker { mut pools }, Event::MarkerCleared) => {
            pools.pop_front();
            if pools.is_empty() {
                Transition::Succeed
            } else {
                Transition::Next(Step::ClearMarker { pools })
            }
        }
        (_, Event::Failed(e)) => Transition::Fail(e),
        (step, event) => Transition::Fail(RemoteError::Failed(format!(
            "protocol violation: {event:?} in {step:?}"
        ))),
    }
}

pub(crate) async fn run(coordinator: Arc<PinCoordinator>, spec: UnpinnerSpec) {
    let marker = StickyMarker::for_pin(spec.pin_id);
    let timeout = coordinator.remote_timeout;

    let mut current = match &spec.pool {
        Some(pool) => Step::ClearLegacyFlag {
            pools: VecDeque::from([pool.clone()]),
        },
        None => Step::ResolveLocations,
    };

    loop {
        let event = match &current {
            Step::ResolveLocations => {
                match step(timeout, coordinator.namespace.cache_locations(&spec.file)).await {
                    Ok(pools) => Event::Locations(pools),
                    Err(RemoteError::FileMissing) => Event::FileGone,
                    Err(e) => Event::Failed(e),
                }
            }
            Step::ClearLegacyFlag { .. } => {
                match step(
                    timeout,
                    coordinator.namespace.clear_legacy_pin_flag(&spec.file),
                )
                .await
                {
                    Ok(()) => Event::LegacyCleared,
                    Err(RemoteError::FileMissing) => Event::FileGone,
                    Err(e) => Event::Failed(e),
                }
            }
            Step::ClearMarker { pools } => {
                // Non-empty by construction; Succeed is returned before
                // an empty queue re-enters this state.
                let pool = &pools[0];
                match step(
                    timeout,
                    coordinator.pools.set_sticky(
                        pool,
                        &spec.file,
                        &marker,
                        gridpin_core::Expiry::Never,
                        false,
                    ),
                )
                .await
                {
                    Ok(()) => Event::MarkerCleared,
                    Err(RemoteError::FileMissing) => Event::FileGone,
                    Err(e) => Event::Failed(e),
                }
            }
        };

        match advance(current, event) {
            Transition::Next(next) => current = next,
            Transition::Succeed => {
                debug!(pin = %spec.pin_id, "markers cleared");
                coordinator.unpin_succeeded(&spec.file, spec.pin_id).await;
                return;
            }
            Transition::Fail(reason) => {
                coordinator
                    .unpin_failed(&spec.file, spec.pin_id, &reason)
                    .await;
                return;
            }
        }
    }
}
