//! Short-lived asynchronous workers.
//!
//! Each worker executes a short fixed protocol against the collaborator
//! services, modelled as an explicit `state × event → transition` table
//! (a pure function, unit-tested without any network fake) driven by a
//! small async loop. Every remote step runs under the configured
//! per-step timeout; a timeout and an explicit remote error are the same
//! failure to everything above the worker. Exactly one terminal
//! coordinator callback is made per worker.

pub(crate) mod extender;
pub(crate) mod mover;
pub(crate) mod pinner;
pub(crate) mod unpinner;

use gridpin_core::RemoteError;
use std::future::Future;
use std::time::Duration;

/// Runs one remote step under the per-step timeout.
pub(crate) async fn step<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}
