use minicbor::{Decode, Encode};
use std::fmt;

/// Opaque identifier of a file in the namespace.
///
/// Files are referred to by id everywhere; the pin service never sees
/// paths. An id must contain at least one non-whitespace character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct FileId(#[n(0)] String);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("file id must not be empty")]
pub struct InvalidFileId;

impl FileId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidFileId> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InvalidFileId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FileId {
    type Err = InvalidFileId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Name of a storage pool as known to the pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct PoolName(#[n(0)] String);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("pool name must not be empty")]
pub struct InvalidPoolName;

impl PoolName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidPoolName> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(InvalidPoolName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the client that created a pin request, used by the
/// unpin policy. Opaque to the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct Owner(#[n(0)] String);

impl Owner {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a [`crate::Pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct PinId(#[n(0)] pub u64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a [`crate::PinRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
#[cbor(transparent)]
pub struct RequestId(#[n(0)] pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an eviction-exemption marker on a pool.
///
/// Derived from the pin id so that independent pins of the same file
/// coexist on one pool without clobbering each other's marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StickyMarker(String);

impl StickyMarker {
    pub fn for_pin(pin: PinId) -> Self {
        Self(format!("gridpin-{}", pin.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StickyMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
