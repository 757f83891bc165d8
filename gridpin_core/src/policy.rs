//! Authorization policies.

use crate::ids::Owner;
use crate::pin::PinRequest;
use crate::remote::Staging;

/// Gates the release of individual pin requests when the caller did not
/// pass `force`.
pub trait UnpinPolicy: Send + Sync + 'static {
    fn may_unpin(&self, requester: Option<&Owner>, request: &PinRequest) -> bool;
}

/// Default policy: a request recorded with an owner may only be released
/// by that owner; ownerless requests may be released by anyone.
pub struct OwnerUnpinPolicy;

impl UnpinPolicy for OwnerUnpinPolicy {
    fn may_unpin(&self, requester: Option<&Owner>, request: &PinRequest) -> bool {
        match &request.owner {
            None => true,
            Some(owner) => requester == Some(owner),
        }
    }
}

/// Decides whether a requester may trigger a stage-from-tape while a
/// read pool is selected for their pin.
pub trait StagePolicy: Send + Sync + 'static {
    fn staging_for(&self, requester: Option<&Owner>) -> Staging;
}

/// Default policy: everyone may stage. Matches the behavior for
/// administratively originated pins, which carry no identity.
pub struct PermissiveStagePolicy;

impl StagePolicy for PermissiveStagePolicy {
    fn staging_for(&self, _requester: Option<&Owner>) -> Staging {
        Staging::Allowed
    }
}
