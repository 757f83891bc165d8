//! The file-scoped store transaction.

use crate::{IdAllocator, PINS, REQUESTS, StoreError, StoreResult, decode, encode};
use gridpin_core::{Expiry, FileId, Owner, Pin, PinId, PinRequest, PinState, PoolName, RequestId};
use redb::{Database, ReadTransaction, ReadableTable};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// A transaction over the pins of one file.
///
/// Holds the file lock from [`crate::PinStore::begin`] until it is
/// committed or dropped, reads through a consistent snapshot overlaid
/// with its own staged writes, and persists everything atomically on
/// [`Txn::commit`].
pub struct Txn {
    db: Arc<Database>,
    ids: Arc<IdAllocator>,
    _guard: OwnedMutexGuard<()>,
    snapshot: ReadTransaction,
    staged_pins: HashMap<u64, Option<Pin>>,
    staged_requests: HashMap<u64, Option<PinRequest>>,
}

impl Txn {
    pub(crate) fn new(
        db: Arc<Database>,
        ids: Arc<IdAllocator>,
        guard: OwnedMutexGuard<()>,
    ) -> StoreResult<Self> {
        let snapshot = db.begin_read()?;
        Ok(Self {
            db,
            ids,
            _guard: guard,
            snapshot,
            staged_pins: HashMap::new(),
            staged_requests: HashMap::new(),
        })
    }

    /// Returns the unique active pin for the file, creating one in
    /// `Initial` if there is none. The boolean is true when a row was
    /// reserved.
    pub fn reserve_or_get_active_pin(
        &mut self,
        file: &FileId,
        now: u64,
    ) -> StoreResult<(Pin, bool)> {
        if let Some(pin) = self
            .pins_for_file(file)?
            .into_iter()
            .find(|pin| pin.is_active())
        {
            return Ok((pin, false));
        }

        let id = PinId(self.ids.next_id(&self.db)?);
        let pin = Pin {
            id,
            file: file.clone(),
            created_at: now,
            // Placeholder; the caller raises it when the first request
            // is attached.
            expiry: Expiry::At(now),
            pool: None,
            state: PinState::Initial,
            state_changed_at: now,
        };
        self.staged_pins.insert(id.0, Some(pin.clone()));
        Ok((pin, true))
    }

    /// Inserts a fresh pin row, used for repins and moves.
    pub fn insert_pin(
        &mut self,
        file: &FileId,
        expiry: Expiry,
        pool: Option<PoolName>,
        state: PinState,
        now: u64,
    ) -> StoreResult<Pin> {
        let id = PinId(self.ids.next_id(&self.db)?);
        let pin = Pin {
            id,
            file: file.clone(),
            created_at: now,
            expiry,
            pool,
            state,
            state_changed_at: now,
        };
        self.staged_pins.insert(id.0, Some(pin.clone()));
        Ok(pin)
    }

    pub fn insert_request(
        &mut self,
        pin_id: PinId,
        expiry: Expiry,
        correlation_id: Option<u64>,
        owner: Option<Owner>,
        now: u64,
    ) -> StoreResult<PinRequest> {
        let id = RequestId(self.ids.next_id(&self.db)?);
        let request = PinRequest {
            id,
            pin_id,
            created_at: now,
            expiry,
            correlation_id,
            owner,
        };
        self.staged_requests.insert(id.0, Some(request.clone()));
        Ok(request)
    }

    /// Rereads a pin under the lock. Callbacks use this to re-validate
    /// state before applying a worker outcome.
    pub fn pin_for_update(&self, id: PinId) -> StoreResult<Option<Pin>> {
        self.read_pin(id.0)
    }

    /// The pin owning the given request, with the request itself.
    pub fn pin_by_request(&self, request: RequestId) -> StoreResult<Option<(Pin, PinRequest)>> {
        let Some(request) = self.read_request(request.0)? else {
            return Ok(None);
        };
        match self.read_pin(request.pin_id.0)? {
            Some(pin) => Ok(Some((pin, request))),
            None => Ok(None),
        }
    }

    pub fn pins_for_file(&self, file: &FileId) -> StoreResult<Vec<Pin>> {
        let mut pins = self.merged_pins()?;
        pins.retain(|pin| &pin.file == file);
        pins.sort_by_key(|pin| pin.id);
        Ok(pins)
    }

    pub fn requests_for_pin(&self, pin: PinId) -> StoreResult<Vec<PinRequest>> {
        let mut requests = self.merged_requests()?;
        requests.retain(|request| request.pin_id == pin);
        requests.sort_by_key(|request| request.id);
        Ok(requests)
    }

    /// Looks up a live request by the client-supplied correlation id.
    pub fn request_by_correlation(
        &self,
        file: &FileId,
        correlation_id: u64,
    ) -> StoreResult<Option<PinRequest>> {
        let pins: std::collections::HashSet<PinId> = self
            .pins_for_file(file)?
            .into_iter()
            .map(|pin| pin.id)
            .collect();
        Ok(self.merged_requests()?.into_iter().find(|request| {
            request.correlation_id == Some(correlation_id) && pins.contains(&request.pin_id)
        }))
    }

    /// Applies a partial update; fields passed as `None` keep their
    /// current value.
    pub fn update_pin(
        &mut self,
        id: PinId,
        expiry: Option<Expiry>,
        pool: Option<PoolName>,
        state: Option<PinState>,
        now: u64,
    ) -> StoreResult<Pin> {
        let mut pin = self.read_pin(id.0)?.ok_or(StoreError::Missing {
            kind: "pin",
            id: id.0,
        })?;
        if let Some(expiry) = expiry {
            pin.expiry = expiry;
        }
        if let Some(pool) = pool {
            pin.pool = Some(pool);
        }
        if let Some(state) = state {
            if pin.state != state {
                pin.state = state;
                pin.state_changed_at = now;
            }
        }
        self.staged_pins.insert(id.0, Some(pin.clone()));
        Ok(pin)
    }

    pub fn update_request_expiry(&mut self, id: RequestId, expiry: Expiry) -> StoreResult<()> {
        let mut request = self.read_request(id.0)?.ok_or(StoreError::Missing {
            kind: "request",
            id: id.0,
        })?;
        request.expiry = expiry;
        self.staged_requests.insert(id.0, Some(request));
        Ok(())
    }

    /// Reattaches a request to another pin, used when requests are
    /// consolidated after a repin or move.
    pub fn move_request(&mut self, id: RequestId, new_pin: PinId) -> StoreResult<()> {
        let mut request = self.read_request(id.0)?.ok_or(StoreError::Missing {
            kind: "request",
            id: id.0,
        })?;
        request.pin_id = new_pin;
        self.staged_requests.insert(id.0, Some(request));
        Ok(())
    }

    /// Idempotent; deleting an already-gone request is fine.
    pub fn delete_request(&mut self, id: RequestId) -> StoreResult<()> {
        self.staged_requests.insert(id.0, None);
        Ok(())
    }

    /// Idempotent; deleting an already-gone pin is fine.
    pub fn delete_pin(&mut self, id: PinId) -> StoreResult<()> {
        self.staged_pins.insert(id.0, None);
        Ok(())
    }

    /// Persists every staged change in one write transaction and
    /// releases the file lock.
    pub fn commit(self) -> StoreResult<()> {
        let Txn {
            db,
            ids: _,
            _guard,
            snapshot,
            staged_pins,
            staged_requests,
        } = self;
        drop(snapshot);

        if staged_pins.is_empty() && staged_requests.is_empty() {
            return Ok(());
        }

        let wt = db.begin_write()?;
        {
            let mut pins = wt.open_table(PINS)?;
            for (id, entry) in &staged_pins {
                match entry {
                    Some(pin) => {
                        pins.insert(*id, encode(pin)?.as_slice())?;
                    }
                    None => {
                        pins.remove(*id)?;
                    }
                }
            }
            let mut requests = wt.open_table(REQUESTS)?;
            for (id, entry) in &staged_requests {
                match entry {
                    Some(request) => {
                        requests.insert(*id, encode(request)?.as_slice())?;
                    }
                    None => {
                        requests.remove(*id)?;
                    }
                }
            }
        }
        wt.commit()?;
        Ok(())
    }

    /// Discards every staged change and releases the file lock.
    pub fn rollback(self) {}

    // --- Overlay reads ---

    fn read_pin(&self, id: u64) -> StoreResult<Option<Pin>> {
        if let Some(entry) = self.staged_pins.get(&id) {
            return Ok(entry.clone());
        }
        let pins = self.snapshot.open_table(PINS)?;
        pins.get(id)?.map(|v| decode(v.value())).transpose()
    }

    fn read_request(&self, id: u64) -> StoreResult<Option<PinRequest>> {
        if let Some(entry) = self.staged_requests.get(&id) {
            return Ok(entry.clone());
        }
        let requests = self.snapshot.open_table(REQUESTS)?;
        requests.get(id)?.map(|v| decode(v.value())).transpose()
    }

    fn merged_pins(&self) -> StoreResult<Vec<Pin>> {
        let mut merged: HashMap<u64, Pin> = HashMap::new();
        let pins = self.snapshot.open_table(PINS)?;
        for row in pins.iter()? {
            let (key, value) = row?;
            merged.insert(key.value(), decode(value.value())?);
        }
        for (id, entry) in &self.staged_pins {
            match entry {
                Some(pin) => {
                    merged.insert(*id, pin.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn merged_requests(&self) -> StoreResult<Vec<PinRequest>> {
        let mut merged: HashMap<u64, PinRequest> = HashMap::new();
        let requests = self.snapshot.open_table(REQUESTS)?;
        for row in requests.iter()? {
            let (key, value) = row?;
            merged.insert(key.value(), decode(value.value())?);
        }
        for (id, entry) in &self.staged_requests {
            match entry {
                Some(request) => {
                    merged.insert(*id, request.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().collect())
    }
}
