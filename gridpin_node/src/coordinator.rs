//! The façade accepting pin lifecycle requests.
//!
//! Every operation validates its inputs, opens a file-scoped store
//! transaction, applies the fast path when it can and otherwise commits
//! the new state *before* spawning the worker that acts on it. Callers
//! whose outcome depends on a worker are parked in the reply tracker and
//! resolved exactly once from the worker's callback.

mod admin;
mod callbacks;

pub use admin::{JobSnapshot, JobState};
pub(crate) use callbacks::Handoff;

use crate::config::NodeConfig;
use crate::tracker::{ReplyTracker, WaiterKind};
use crate::workers::extender::ExtenderSpec;
use crate::workers::mover::MoverSpec;
use crate::workers::pinner::PinnerSpec;
use crate::workers::unpinner::UnpinnerSpec;
use crate::workers::{extender, mover, pinner, unpinner};
use admin::JobRegistry;
use gridpin_core::{
    Expiry, FileId, Lease, Namespace, Owner, OwnerUnpinPolicy, PermissiveStagePolicy, Pin,
    PinState, Pool, PoolManager, PoolName, RequestId, StagePolicy, UnpinPolicy, now_millis,
};
use gridpin_store::{PinStore, StoreError, Txn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Typed failure returned to a synchronous caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Rejected before any state change.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Rejected by the authorization policy.
    #[error("not authorized: {0}")]
    Denied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The target exists but is not (or no longer) pinned.
    #[error("{0}")]
    NotPinned(String),

    /// The store transaction failed; the request had no effect.
    #[error("persistence failure: {0}")]
    Store(String),

    /// A worker reported the operation failed.
    #[error("{0}")]
    Failed(String),
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        RequestError::Store(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PinArgs {
    pub file: String,
    /// Positive seconds, or -1 for an infinite lease.
    pub lease_seconds: i64,
    /// Idempotency token: a duplicate request with the same correlation
    /// id for the same file attaches to the existing lease.
    pub correlation_id: Option<u64>,
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone)]
pub struct UnpinArgs {
    pub file: String,
    /// Release one specific lease; all of the file's leases otherwise.
    pub request_id: Option<u64>,
    /// Locate the lease by its correlation id instead.
    pub correlation_id: Option<u64>,
    pub requester: Option<Owner>,
    /// Bypasses both the authorization policy and the pinned-state
    /// precondition.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ExtendArgs {
    pub file: String,
    pub request_id: u64,
    pub lease_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct MoveArgs {
    pub file: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinGrant {
    pub request_id: RequestId,
    pub expiry: Expiry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub expiry: Expiry,
}

pub struct PinCoordinator {
    pub(crate) store: PinStore,
    pub(crate) namespace: Arc<dyn Namespace>,
    pub(crate) pool_manager: Arc<dyn PoolManager>,
    pub(crate) pools: Arc<dyn Pool>,
    pub(crate) unpin_policy: Arc<dyn UnpinPolicy>,
    pub(crate) stage_policy: Arc<dyn StagePolicy>,
    pub(crate) pending: ReplyTracker,
    pub(crate) jobs: JobRegistry,
    pub(crate) remote_timeout: Duration,
    pub(crate) sticky_margin: Duration,
    max_pin_duration: Mutex<Option<Duration>>,
}

impl PinCoordinator {
    pub fn new(
        store: PinStore,
        namespace: Arc<dyn Namespace>,
        pool_manager: Arc<dyn PoolManager>,
        pools: Arc<dyn Pool>,
        config: &NodeConfig,
    ) -> Arc<Self> {
        Self::with_policies(
            store,
            namespace,
            pool_manager,
            pools,
            Arc::new(OwnerUnpinPolicy),
            Arc::new(PermissiveStagePolicy),
            config,
        )
    }

    pub fn with_policies(
        store: PinStore,
        namespace: Arc<dyn Namespace>,
        pool_manager: Arc<dyn PoolManager>,
        pools: Arc<dyn Pool>,
        unpin_policy: Arc<dyn UnpinPolicy>,
        stage_policy: Arc<dyn StagePolicy>,
        config: &NodeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace,
            pool_manager,
            pools,
            unpin_policy,
            stage_policy,
            pending: ReplyTracker::new(),
            jobs: JobRegistry::new(),
            remote_timeout: config.remote_timeout(),
            sticky_margin: config.sticky_margin(),
            max_pin_duration: Mutex::new(config.max_pin_duration()),
        })
    }

    pub fn store(&self) -> &PinStore {
        &self.store
    }

    /// Keeps the file resident for the requested lease. Resolves once
    /// the marker is confirmed (or immediately when an existing pin
    /// already covers the lease).
    pub async fn pin(self: &Arc<Self>, args: PinArgs) -> Result<PinGrant, RequestError> {
        let file = FileId::new(args.file).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let lease = Lease::from_raw(args.lease_seconds)
            .map_err(|e| RequestError::Invalid(e.to_string()))?;
        let lease = self.cap_lease(lease);
        let now = now_millis();
        let expiry = lease.expiry_from(now);

        let mut txn = self.store.begin(&file).await?;

        // Duplicate delivery: attach to the existing lease.
        if let Some(correlation) = args.correlation_id
            && let Some(existing) = txn.request_by_correlation(&file, correlation)?
            && let Some(pin) = txn.pin_for_update(existing.pin_id)?
            && pin.is_active()
        {
            debug!(%file, correlation, request = %existing.id, "duplicate pin request, reusing lease");
            return self.attach_to_existing(txn, &pin, existing.id, existing.expiry).await;
        }

        let (pin, reserved) = txn.reserve_or_get_active_pin(&file, now)?;
        let request = txn.insert_request(
            pin.id,
            expiry,
            args.correlation_id,
            args.owner.clone(),
            now,
        )?;
        let pin_expiry = if reserved { expiry } else { pin.expiry.max(expiry) };

        match pin.state {
            PinState::Pinned => {
                if pin.expiry.covers(expiry) {
                    txn.commit()?;
                    debug!(%file, pin = %pin.id, "already pinned, lease covered");
                    return Ok(PinGrant {
                        request_id: request.id,
                        expiry,
                    });
                }
                // The new lease outlives the marker; stretch it.
                let Some(pool) = pin.pool.clone() else {
                    txn.rollback();
                    return Err(RequestError::Failed(format!(
                        "pin {} is pinned but has no pool",
                        pin.id
                    )));
                };
                txn.update_pin(pin.id, Some(pin_expiry), None, None, now)?;
                let rx = self.pending.park_pin(request.id.0, WaiterKind::Pin);
                if let Err(e) = txn.commit() {
                    self.pending.take_pin(request.id.0);
                    return Err(e.into());
                }
                self.spawn_extender(ExtenderSpec {
                    file,
                    pin_id: pin.id,
                    request_id: Some(request.id),
                    pool,
                    request_expiry: expiry,
                    target: pin_expiry,
                });
                let expiry = Self::await_reply(rx).await?;
                Ok(PinGrant {
                    request_id: request.id,
                    expiry,
                })
            }
            PinState::Pinning => {
                // A pinner is already on its way; park behind it.
                txn.update_pin(pin.id, Some(pin_expiry), None, None, now)?;
                let rx = self.pending.park_pin(request.id.0, WaiterKind::Pin);
                if let Err(e) = txn.commit() {
                    self.pending.take_pin(request.id.0);
                    return Err(e.into());
                }
                debug!(%file, pin = %pin.id, "pinning in progress, request parked");
                let expiry = Self::await_reply(rx).await?;
                Ok(PinGrant {
                    request_id: request.id,
                    expiry,
                })
            }
            PinState::Initial => {
                txn.update_pin(pin.id, Some(pin_expiry), None, Some(PinState::Pinning), now)?;
                let rx = self.pending.park_pin(request.id.0, WaiterKind::Pin);
                if let Err(e) = txn.commit() {
                    self.pending.take_pin(request.id.0);
                    return Err(e.into());
                }
                info!(%file, pin = %pin.id, "pinning started");
                self.spawn_pinner(PinnerSpec {
                    file,
                    pin_id: pin.id,
                    target: pin_expiry,
                    staging: self.stage_policy.staging_for(args.owner.as_ref()),
                });
                let expiry = Self::await_reply(rx).await?;
                Ok(PinGrant {
                    request_id: request.id,
                    expiry,
                })
            }
            state => {
                // reserve_or_get_active_pin only hands out active pins.
                txn.rollback();
                Err(RequestError::Failed(format!(
                    "active pin {} in unexpected state {state}",
                    pin.id
                )))
            }
        }
    }

    async fn attach_to_existing(
        self: &Arc<Self>,
        txn: Txn,
        pin: &Pin,
        request: RequestId,
        granted: Expiry,
    ) -> Result<PinGrant, RequestError> {
        match pin.state {
            PinState::Pinned => {
                txn.commit()?;
                Ok(PinGrant {
                    request_id: request,
                    expiry: granted,
                })
            }
            _ => {
                let rx = self.pending.park_pin(request.0, WaiterKind::Pin);
                if let Err(e) = txn.commit() {
                    self.pending.take_pin(request.0);
                    return Err(e.into());
                }
                let expiry = Self::await_reply(rx).await?;
                Ok(PinGrant {
                    request_id: request,
                    expiry,
                })
            }
        }
    }

    /// Releases one lease (by request or correlation id) or all leases
    /// of the file. The pin itself goes once its last lease does.
    pub async fn unpin(self: &Arc<Self>, args: UnpinArgs) -> Result<(), RequestError> {
        let file = FileId::new(args.file).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let now = now_millis();
        let mut txn = self.store.begin(&file).await?;

        let target = match (args.request_id, args.correlation_id) {
            (Some(id), _) => Some(RequestId(id)),
            (None, Some(correlation)) => match txn.request_by_correlation(&file, correlation)? {
                Some(request) => Some(request.id),
                None => {
                    return Err(RequestError::NotFound(format!(
                        "no pin request with correlation id {correlation} for {file}"
                    )));
                }
            },
            (None, None) => None,
        };

        match target {
            Some(request) => {
                self.unpin_request(txn, &file, request, args.requester.as_ref(), args.force, now)
                    .await
            }
            None => {
                self.unpin_all(txn, &file, args.requester.as_ref(), args.force, now)
                    .await
            }
        }
    }

    async fn unpin_request(
        self: &Arc<Self>,
        mut txn: Txn,
        file: &FileId,
        request_id: RequestId,
        requester: Option<&Owner>,
        force: bool,
        now: u64,
    ) -> Result<(), RequestError> {
        let Some((pin, request)) = txn.pin_by_request(request_id)? else {
            return Err(RequestError::NotFound(format!(
                "pin request {request_id} not found"
            )));
        };
        if &pin.file != file {
            return Err(RequestError::NotFound(format!(
                "pin request {request_id} does not belong to {file}"
            )));
        }
        if !force {
            Self::require_pinned(&pin)?;
            if !self.unpin_policy.may_unpin(requester, &request) {
                return Err(RequestError::Denied(format!(
                    "pin request {request_id} may not be released by this requester"
                )));
            }
        }

        if txn.requests_for_pin(pin.id)?.len() > 1 {
            // Others still hold the pin; only this lease goes.
            txn.delete_request(request_id)?;
            txn.commit()?;
            debug!(%file, request = %request_id, "lease released, pin kept");
            return Ok(());
        }

        txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
        let rx = self.pending.park_unpin(request_id.0);
        if let Err(e) = txn.commit() {
            self.pending.take_unpin(request_id.0);
            return Err(e.into());
        }
        info!(%file, pin = %pin.id, "last lease released, unpinning");
        self.spawn_unpinner(&pin);
        Self::await_reply(rx).await
    }

    async fn unpin_all(
        self: &Arc<Self>,
        mut txn: Txn,
        file: &FileId,
        requester: Option<&Owner>,
        force: bool,
        now: u64,
    ) -> Result<(), RequestError> {
        let pins = txn.pins_for_file(file)?;
        let pin = match pins.iter().find(|pin| pin.is_active()) {
            Some(pin) => pin.clone(),
            // `force` reaches pins stuck in a repair state too.
            None if force => match pins.first() {
                Some(pin) => pin.clone(),
                None => return Err(RequestError::NotFound(format!("no pin for {file}"))),
            },
            None if !pins.is_empty() => {
                return Err(RequestError::NotPinned(format!(
                    "{file} is not pinned, or is already being unpinned"
                )));
            }
            None => return Err(RequestError::NotFound(format!("no pin for {file}"))),
        };
        if !force {
            Self::require_pinned(&pin)?;
        }

        let requests = txn.requests_for_pin(pin.id)?;
        if requests.is_empty() {
            if !force {
                return Err(RequestError::NotFound(format!("no pin requests for {file}")));
            }
            // Force-release of a leaseless pin (e.g. a stuck repair
            // state): dispatch the unpinner, reply provisionally.
            txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
            txn.commit()?;
            info!(%file, pin = %pin.id, "force-unpinning leaseless pin");
            self.spawn_unpinner(&pin);
            return Ok(());
        }

        let allowed: Vec<_> = requests
            .iter()
            .filter(|request| force || self.unpin_policy.may_unpin(requester, request))
            .collect();
        if allowed.is_empty() {
            return Err(RequestError::Denied(format!(
                "no pin request of {file} may be released by this requester"
            )));
        }

        if allowed.len() < requests.len() {
            // Some leases stay; only rows are deleted, the pin survives.
            for request in &allowed {
                txn.delete_request(request.id)?;
            }
            txn.commit()?;
            debug!(%file, released = allowed.len(), "released a subset of leases");
            return Ok(());
        }

        for request in &allowed[..allowed.len() - 1] {
            txn.delete_request(request.id)?;
        }
        let last = allowed[allowed.len() - 1].id;
        txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), now)?;
        let rx = self.pending.park_unpin(last.0);
        if let Err(e) = txn.commit() {
            self.pending.take_unpin(last.0);
            return Err(e.into());
        }
        info!(%file, pin = %pin.id, "all leases released, unpinning");
        self.spawn_unpinner(&pin);
        Self::await_reply(rx).await
    }

    /// Extends one lease. A lease already covering the new expiry is a
    /// no-op answered immediately, without any remote operation.
    pub async fn extend(self: &Arc<Self>, args: ExtendArgs) -> Result<Extension, RequestError> {
        let file = FileId::new(args.file).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let lease = Lease::from_raw(args.lease_seconds)
            .map_err(|e| RequestError::Invalid(e.to_string()))?;
        let lease = self.cap_lease(lease);
        let now = now_millis();
        let request_id = RequestId(args.request_id);

        let txn = self.store.begin(&file).await?;
        let Some((pin, request)) = txn.pin_by_request(request_id)? else {
            return Err(RequestError::NotFound(format!(
                "pin request {request_id} not found"
            )));
        };
        if pin.file != file {
            return Err(RequestError::NotFound(format!(
                "pin request {request_id} does not belong to {file}"
            )));
        }
        if !matches!(
            pin.state,
            PinState::Pinned | PinState::Pinning | PinState::Initial
        ) {
            return Err(RequestError::NotPinned(format!(
                "pin request {request_id} is not pinned anymore"
            )));
        }

        if request.expiry == Expiry::Never {
            txn.commit()?;
            return Ok(Extension {
                expiry: Expiry::Never,
            });
        }
        let new_expiry = lease.expiry_from(now);
        if request.expiry.covers(new_expiry) {
            txn.commit()?;
            debug!(%file, request = %request_id, "lease already covers extension");
            return Ok(Extension {
                expiry: request.expiry,
            });
        }

        let target = pin.expiry.max(new_expiry);
        if pin.state != PinState::Pinned || pin.expiry.covers(new_expiry) {
            // No marker to stretch (yet): either the pinner will install
            // one long enough, or the existing marker already covers it.
            let mut txn = txn;
            txn.update_request_expiry(request_id, new_expiry)?;
            txn.update_pin(pin.id, Some(target), None, None, now)?;
            txn.commit()?;
            return Ok(Extension { expiry: new_expiry });
        }

        let Some(pool) = pin.pool.clone() else {
            return Err(RequestError::Failed(format!(
                "pin {} is pinned but has no pool",
                pin.id
            )));
        };
        let rx = self.pending.park_pin(request_id.0, WaiterKind::Extend);
        if let Err(e) = txn.commit() {
            self.pending.take_pin(request_id.0);
            return Err(e.into());
        }
        info!(%file, request = %request_id, %target, "extending marker");
        self.spawn_extender(ExtenderSpec {
            file,
            pin_id: pin.id,
            request_id: Some(request_id),
            pool,
            request_expiry: new_expiry,
            target,
        });
        let expiry = Self::await_reply(rx).await?;
        Ok(Extension { expiry })
    }

    /// Administrative relocation of a pinned file's marker from one
    /// pool to another. Client leases survive the move untouched.
    pub async fn move_pin(self: &Arc<Self>, args: MoveArgs) -> Result<(), RequestError> {
        let file = FileId::new(args.file).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let source =
            PoolName::new(args.source).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let target =
            PoolName::new(args.target).map_err(|e| RequestError::Invalid(e.to_string()))?;
        let now = now_millis();

        let mut txn = self.store.begin(&file).await?;
        let Some(src) = txn
            .pins_for_file(&file)?
            .into_iter()
            .find(|pin| pin.state == PinState::Pinned && pin.pool.as_ref() == Some(&source))
        else {
            return Err(RequestError::NotFound(format!(
                "no pinned copy of {file} at {source}"
            )));
        };

        let dst = txn.insert_pin(&file, src.expiry, Some(target.clone()), PinState::Moving, now)?;
        txn.commit()?;
        info!(%file, %source, %target, src = %src.id, dst = %dst.id, "moving pin");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(mover::run(
            self.clone(),
            MoverSpec {
                file,
                src_pin: src.id,
                dst_pin: dst.id,
                target_pool: target,
                expiry: src.expiry,
                reply: tx,
            },
        ));
        Self::await_reply(rx).await
    }

    /// Drops every pin of files deleted from the fabric, failing any
    /// caller still waiting on them. No markers are cleared; the pools
    /// already dropped the replicas.
    pub async fn files_removed(&self, files: &[FileId]) {
        for file in files {
            if let Err(e) = self.drop_file(file).await {
                tracing::warn!(%file, "failed to drop pins of removed file: {e}");
            }
        }
    }

    async fn drop_file(&self, file: &FileId) -> Result<(), RequestError> {
        let mut txn = self.store.begin(file).await?;
        let pins = txn.pins_for_file(file)?;
        if pins.is_empty() {
            txn.rollback();
            return Ok(());
        }
        let mut dropped = Vec::new();
        for pin in pins {
            for request in txn.requests_for_pin(pin.id)? {
                dropped.push(request.id);
                txn.delete_request(request.id)?;
            }
            txn.delete_pin(pin.id)?;
        }
        txn.commit()?;
        info!(%file, leases = dropped.len(), "file removed, pins dropped");
        for request in dropped {
            self.pending
                .resolve_pin(request.0, Err(RequestError::Failed("file removed".into())));
            // An unpin of a removed file has nothing left to do.
            self.pending.resolve_unpin(request.0, Ok(()));
        }
        Ok(())
    }

    // --- helpers ---

    fn require_pinned(pin: &Pin) -> Result<(), RequestError> {
        match pin.state {
            PinState::Pinned => Ok(()),
            PinState::Initial | PinState::Pinning => Err(RequestError::NotPinned(format!(
                "{} is not pinned yet",
                pin.file
            ))),
            _ => Err(RequestError::NotPinned(format!(
                "{} is not pinned, or is already being unpinned",
                pin.file
            ))),
        }
    }

    fn cap_lease(&self, lease: Lease) -> Lease {
        let max = *self.max_pin_duration.lock().expect("max duration poisoned");
        let capped = lease.capped(max);
        if capped != lease {
            info!(?lease, ?capped, "lease clamped to configured maximum");
        }
        capped
    }

    async fn await_reply<T>(rx: oneshot::Receiver<Result<T, RequestError>>) -> Result<T, RequestError> {
        rx.await
            .map_err(|_| RequestError::Failed("coordinator dropped the reply".into()))?
    }

    pub(crate) fn max_duration(&self) -> Option<Duration> {
        *self.max_pin_duration.lock().expect("max duration poisoned")
    }

    pub(crate) fn replace_max_duration(&self, max: Option<Duration>) -> Option<Duration> {
        let mut guard = self.max_pin_duration.lock().expect("max duration poisoned");
        std::mem::replace(&mut *guard, max)
    }

    pub(crate) fn spawn_pinner(self: &Arc<Self>, spec: PinnerSpec) {
        tokio::spawn(pinner::run(self.clone(), spec));
    }

    pub(crate) fn spawn_extender(self: &Arc<Self>, spec: ExtenderSpec) {
        tokio::spawn(extender::run(self.clone(), spec));
    }

    pub(crate) fn spawn_unpinner(self: &Arc<Self>, pin: &Pin) {
        tokio::spawn(unpinner::run(
            self.clone(),
            UnpinnerSpec {
                file: pin.file.clone(),
                pin_id: pin.id,
                pool: pin.pool.clone(),
            },
        ));
    }
}

impl std::fmt::Debug for PinCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PinCoordinator")
    }
}
