//! # gridpin node
//!
//! The pin-lifecycle orchestration engine. A [`PinCoordinator`] accepts
//! pin/unpin/extend/move requests, serializes conflicting operations on
//! the same file through the store's per-file transactions, and dispatches
//! short-lived workers that install, extend and remove eviction-exemption
//! markers on remote pools. A [`Sweeper`] repairs whatever a crash or a
//! failed worker leaves behind.
//!
//! State is committed before the worker acting on it is spawned, so a
//! crash between the two is observed and retried by the next sweeper
//! cycle instead of losing the operation.

pub mod config;
pub mod coordinator;
pub mod sweeper;
mod tracker;
mod workers;

pub use config::NodeConfig;
pub use coordinator::{
    ExtendArgs, Extension, MoveArgs, PinArgs, PinCoordinator, PinGrant, RequestError, UnpinArgs,
};
pub use sweeper::Sweeper;

use std::sync::Arc;

/// Runs the startup reconciliation and launches the periodic sweeper.
///
/// Resolves once the startup drain is done, so a caller can start
/// accepting requests the moment this returns. The returned handle owns
/// the sweeper loop.
pub async fn start(
    coordinator: Arc<PinCoordinator>,
    config: &NodeConfig,
) -> tokio::task::JoinHandle<()> {
    let sweeper = Sweeper::new(coordinator, config.sweep_interval());
    sweeper.startup().await;
    tokio::spawn(sweeper.run())
}
