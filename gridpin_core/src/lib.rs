//! # gridpin core
//!
//! Types and traits shared by all gridpin crates: file and pool
//! identifiers, pin entities and their state machine, lease/expiry
//! arithmetic, and the collaborator interfaces (namespace, pool manager,
//! pools) the workers talk to.
//!
//! The crates layer as follows:
//! 1. `gridpin_core`  – identifiers, entities, collaborator traits.
//! 2. `gridpin_store` – durable, transactional pin repository.
//! 3. `gridpin_node`  – coordinator, workers, reconciliation sweeper.
//! 4. `gridpin_cli`   – offline inspection front end.

mod ids;
pub mod pin;
pub mod policy;
pub mod remote;
pub mod time;

#[cfg(feature = "testutil")]
pub mod testutil;

pub use ids::{FileId, InvalidFileId, InvalidPoolName, Owner, PinId, PoolName, RequestId, StickyMarker};
pub use pin::{Pin, PinRequest, PinState};
pub use policy::{OwnerUnpinPolicy, PermissiveStagePolicy, StagePolicy, UnpinPolicy};
pub use remote::{FileAttributes, Namespace, Pool, PoolManager, RemoteError, Staging};
pub use time::{Expiry, InvalidLease, Lease, now_millis};
