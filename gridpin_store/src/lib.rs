//! Durable, transactional repository of pins and pin requests.
//!
//! The store is the single source of truth for the pin lifecycle. All
//! mutations go through a [`Txn`] obtained from [`PinStore::begin`], which
//! holds the per-file lock for its whole scope: conflicting operations on
//! the same file serialize, different files proceed in parallel. A `Txn`
//! stages its writes and applies them in one redb write transaction on
//! [`Txn::commit`]; dropping it without committing discards everything.
//!
//! Read-only queries (used by the sweeper and the admin surface) run
//! against a plain redb read snapshot and take no locks.

mod txn;

pub use txn::Txn;

use gridpin_core::{FileId, Pin, PinRequest, PinState};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

pub(crate) const PINS: TableDefinition<u64, &[u8]> = TableDefinition::new("pins");
pub(crate) const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("pin_requests");
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ID_KEY: &str = "next_id";

/// How many ids one batch claim reserves. Large enough that the meta row
/// is touched rarely, small enough that gaps after a restart don't matter.
const ID_BATCH: u64 = 1000;

const LOCK_SHARDS: usize = 64;

/// One typed error for everything the storage layer can do wrong.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{kind} {id} not found")]
    Missing { kind: &'static str, id: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> StoreResult<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> StoreResult<T> {
    minicbor::decode(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Hands out ids for both tables from a shared monotonic counter,
/// claimed from the meta table in batches.
pub(crate) struct IdAllocator {
    state: Mutex<IdBatch>,
}

struct IdBatch {
    next: u64,
    limit: u64,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            state: Mutex::new(IdBatch { next: 0, limit: 0 }),
        }
    }

    pub(crate) fn next_id(&self, db: &Database) -> StoreResult<u64> {
        let mut batch = self.state.lock().expect("id allocator poisoned");
        if batch.next >= batch.limit {
            let wt = db.begin_write()?;
            let base = {
                let mut meta = wt.open_table(META)?;
                let base = meta.get(NEXT_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
                meta.insert(NEXT_ID_KEY, base + ID_BATCH)?;
                base
            };
            wt.commit()?;
            *batch = IdBatch {
                next: base,
                limit: base + ID_BATCH,
            };
        }
        let id = batch.next;
        batch.next += 1;
        Ok(id)
    }
}

/// Serializes transactions per file. Sharded so the lock table stays
/// bounded; a shard collision only costs unnecessary serialization,
/// never correctness.
struct FileLocks {
    shards: Vec<Arc<tokio::sync::Mutex<()>>>,
}

impl FileLocks {
    fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS)
                .map(|_| Arc::new(tokio::sync::Mutex::new(())))
                .collect(),
        }
    }

    async fn lock(&self, file: &FileId) -> OwnedMutexGuard<()> {
        let mut hasher = DefaultHasher::new();
        file.hash(&mut hasher);
        let index = (hasher.finish() as usize) % LOCK_SHARDS;
        self.shards[index].clone().lock_owned().await
    }
}

#[derive(Clone)]
pub struct PinStore {
    db: Arc<Database>,
    locks: Arc<FileLocks>,
    ids: Arc<IdAllocator>,
}

impl PinStore {
    /// Opens (or creates) the store under the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = Database::create(path.as_ref().join("pins.redb"))?;

        // Touch every table once so later read snapshots see them.
        let wt = db.begin_write()?;
        wt.open_table(PINS)?;
        wt.open_table(REQUESTS)?;
        wt.open_table(META)?;
        wt.commit()?;

        Ok(Self {
            db: Arc::new(db),
            locks: Arc::new(FileLocks::new()),
            ids: Arc::new(IdAllocator::new()),
        })
    }

    /// Opens a transaction scoped to `file`, waiting for any other
    /// transaction on the same file to finish first.
    pub async fn begin(&self, file: &FileId) -> StoreResult<Txn> {
        let guard = self.locks.lock(file).await;
        Txn::new(self.db.clone(), self.ids.clone(), guard)
    }

    /// All pins currently in `state`.
    pub fn pins_in_state(&self, state: PinState) -> StoreResult<Vec<Pin>> {
        self.scan_pins(|pin| pin.state == state)
    }

    /// Every pin of the given file, in any state.
    pub fn pins_for_file(&self, file: &FileId) -> StoreResult<Vec<Pin>> {
        self.scan_pins(|pin| &pin.file == file)
    }

    pub fn pin_by_id(&self, id: u64) -> StoreResult<Option<Pin>> {
        let rt = self.db.begin_read()?;
        let pins = rt.open_table(PINS)?;
        pins.get(id)?.map(|v| decode(v.value())).transpose()
    }

    pub fn requests_for_pin(&self, pin_id: u64) -> StoreResult<Vec<PinRequest>> {
        let rt = self.db.begin_read()?;
        let requests = rt.open_table(REQUESTS)?;
        let mut out = Vec::new();
        for row in requests.iter()? {
            let (_, value) = row?;
            let request: PinRequest = decode(value.value())?;
            if request.pin_id.0 == pin_id {
                out.push(request);
            }
        }
        Ok(out)
    }

    /// Requests whose lease ran out at or before `now`.
    pub fn expired_requests(&self, now: u64) -> StoreResult<Vec<PinRequest>> {
        let rt = self.db.begin_read()?;
        let requests = rt.open_table(REQUESTS)?;
        let mut out = Vec::new();
        for row in requests.iter()? {
            let (_, value) = row?;
            let request: PinRequest = decode(value.value())?;
            if request.expiry.is_expired(now) {
                out.push(request);
            }
        }
        Ok(out)
    }

    /// Pins past their expiry that no request holds any more.
    pub fn expired_orphan_pins(&self, now: u64) -> StoreResult<Vec<Pin>> {
        let orphans = self.scan_pins(|pin| pin.expiry.is_expired(now))?;
        let rt = self.db.begin_read()?;
        let requests = rt.open_table(REQUESTS)?;
        let mut held = std::collections::HashSet::new();
        for row in requests.iter()? {
            let (_, value) = row?;
            let request: PinRequest = decode(value.value())?;
            held.insert(request.pin_id);
        }
        Ok(orphans
            .into_iter()
            .filter(|pin| !held.contains(&pin.id))
            .collect())
    }

    /// Pins a crash may have left behind: everything not safely
    /// `Pinned`. Used by the startup inventory.
    pub fn incomplete_pins(&self) -> StoreResult<Vec<Pin>> {
        self.scan_pins(|pin| pin.state != PinState::Pinned)
    }

    /// Every pin with its requests, for the admin listing.
    pub fn all_pins(&self) -> StoreResult<Vec<(Pin, Vec<PinRequest>)>> {
        let rt = self.db.begin_read()?;
        let pins = rt.open_table(PINS)?;
        let requests = rt.open_table(REQUESTS)?;

        let mut by_pin: std::collections::HashMap<u64, Vec<PinRequest>> =
            std::collections::HashMap::new();
        for row in requests.iter()? {
            let (_, value) = row?;
            let request: PinRequest = decode(value.value())?;
            by_pin.entry(request.pin_id.0).or_default().push(request);
        }

        let mut out = Vec::new();
        for row in pins.iter()? {
            let (key, value) = row?;
            let pin: Pin = decode(value.value())?;
            let mut reqs = by_pin.remove(&key.value()).unwrap_or_default();
            reqs.sort_by_key(|r| r.id);
            out.push((pin, reqs));
        }
        out.sort_by_key(|(pin, _)| pin.id);
        Ok(out)
    }

    fn scan_pins(&self, keep: impl Fn(&Pin) -> bool) -> StoreResult<Vec<Pin>> {
        let rt = self.db.begin_read()?;
        let pins = rt.open_table(PINS)?;
        let mut out = Vec::new();
        for row in pins.iter()? {
            let (_, value) = row?;
            let pin: Pin = decode(value.value())?;
            if keep(&pin) {
                out.push(pin);
            }
        }
        out.sort_by_key(|pin| pin.id);
        Ok(out)
    }
}

impl std::fmt::Debug for PinStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PinStore")
    }
}
