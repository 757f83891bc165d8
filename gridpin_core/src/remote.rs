//! Collaborator interfaces consumed by the workers.
//!
//! The wire transport behind these traits is somebody else's problem;
//! gridpin only sees the logical operations. Implementations are expected
//! to resolve or fail each call on their own — per-step timeouts are
//! applied by the caller.

use crate::ids::{FileId, PoolName, StickyMarker};
use crate::time::Expiry;
use async_trait::async_trait;

/// Why a remote step did not produce a usable answer.
///
/// A timeout and an explicit remote failure are equivalent to the layer
/// above a worker; only [`RemoteError::FileMissing`] carries meaning of
/// its own (an unpin of a vanished file counts as success).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("file does not exist")]
    FileMissing,

    #[error("remote step timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

/// Attributes the pool manager needs to place a read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub file: FileId,
    pub size: u64,
    /// Storage class, when the namespace knows one; opaque to gridpin.
    pub storage_class: Option<String>,
}

/// Whether the pool manager may stage the file from tape to satisfy
/// the pool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    Allowed,
    Denied,
}

/// File metadata and cache-location service.
#[async_trait]
pub trait Namespace: Send + Sync + 'static {
    async fn file_attributes(&self, file: &FileId) -> Result<FileAttributes, RemoteError>;

    /// Pools currently holding a cached replica of the file.
    async fn cache_locations(&self, file: &FileId) -> Result<Vec<PoolName>, RemoteError>;

    /// Clears the namespace-level pin flag left behind by pre-migration
    /// pins. A no-op for files that never carried one.
    async fn clear_legacy_pin_flag(&self, file: &FileId) -> Result<(), RemoteError>;
}

/// Selects the pool that should serve (and possibly stage) a file.
#[async_trait]
pub trait PoolManager: Send + Sync + 'static {
    async fn select_read_pool(
        &self,
        attrs: &FileAttributes,
        staging: Staging,
    ) -> Result<PoolName, RemoteError>;
}

/// Marker operations on the storage pools.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    /// Installs (`on = true`) or clears (`on = false`) a named sticky
    /// marker for the file on the given pool.
    async fn set_sticky(
        &self,
        pool: &PoolName,
        file: &FileId,
        marker: &StickyMarker,
        expiry: Expiry,
        on: bool,
    ) -> Result<(), RemoteError>;
}
