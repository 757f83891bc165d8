//! Fake collaborator services for integration tests.
//!
//! In your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! gridpin_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! The fakes answer from in-memory tables and can be told to fail or to
//! pretend a file is gone, so worker and sweeper paths can be exercised
//! without any storage fabric.

use crate::ids::{FileId, PoolName, StickyMarker};
use crate::remote::{FileAttributes, Namespace, Pool, PoolManager, RemoteError, Staging};
use crate::time::Expiry;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory namespace service.
#[derive(Default)]
pub struct FakeNamespace {
    files: Mutex<HashMap<FileId, FileAttributes>>,
    locations: Mutex<HashMap<FileId, Vec<PoolName>>>,
    legacy_cleared: Mutex<Vec<FileId>>,
    lookup_delay_ms: std::sync::atomic::AtomicU64,
}

impl FakeNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays attribute lookups, keeping a pinner in flight long enough
    /// for tests to race other requests against it.
    pub fn set_lookup_delay(&self, delay: std::time::Duration) {
        self.lookup_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn add_file(&self, file: &FileId, size: u64) {
        self.files.lock().unwrap().insert(
            file.clone(),
            FileAttributes {
                file: file.clone(),
                size,
                storage_class: None,
            },
        );
    }

    pub fn set_locations(&self, file: &FileId, pools: Vec<PoolName>) {
        self.locations.lock().unwrap().insert(file.clone(), pools);
    }

    /// Makes every subsequent lookup of `file` answer `FileMissing`.
    pub fn remove_file(&self, file: &FileId) {
        self.files.lock().unwrap().remove(file);
        self.locations.lock().unwrap().remove(file);
    }

    pub fn legacy_flags_cleared(&self) -> Vec<FileId> {
        self.legacy_cleared.lock().unwrap().clone()
    }
}

#[async_trait]
impl Namespace for FakeNamespace {
    async fn file_attributes(&self, file: &FileId) -> Result<FileAttributes, RemoteError> {
        let delay = self.lookup_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.files
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .ok_or(RemoteError::FileMissing)
    }

    async fn cache_locations(&self, file: &FileId) -> Result<Vec<PoolName>, RemoteError> {
        if !self.files.lock().unwrap().contains_key(file) {
            return Err(RemoteError::FileMissing);
        }
        Ok(self
            .locations
            .lock()
            .unwrap()
            .get(file)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_legacy_pin_flag(&self, file: &FileId) -> Result<(), RemoteError> {
        self.legacy_cleared.lock().unwrap().push(file.clone());
        Ok(())
    }
}

/// Pool manager that hands out one configured pool.
pub struct FakePoolManager {
    pool: Mutex<PoolName>,
    fail: AtomicBool,
    staging_seen: Mutex<Vec<Staging>>,
    selections: AtomicUsize,
}

impl FakePoolManager {
    pub fn new(pool: PoolName) -> Self {
        Self {
            pool: Mutex::new(pool),
            fail: AtomicBool::new(false),
            staging_seen: Mutex::new(Vec::new()),
            selections: AtomicUsize::new(0),
        }
    }

    pub fn set_pool(&self, pool: PoolName) {
        *self.pool.lock().unwrap() = pool;
    }

    pub fn fail_selections(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    pub fn staging_seen(&self) -> Vec<Staging> {
        self.staging_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PoolManager for FakePoolManager {
    async fn select_read_pool(
        &self,
        _attrs: &FileAttributes,
        staging: Staging,
    ) -> Result<PoolName, RemoteError> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        self.staging_seen.lock().unwrap().push(staging);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteError::Failed("no read pool available".into()));
        }
        Ok(self.pool.lock().unwrap().clone())
    }
}

/// Marker table shared by all fake pools, keyed by pool, file and
/// marker name.
#[derive(Default)]
pub struct FakePool {
    markers: Mutex<HashMap<(PoolName, FileId, String), Expiry>>,
    missing: Mutex<HashSet<FileId>>,
    fail_installs: AtomicBool,
    fail_clears: AtomicBool,
    installs: AtomicUsize,
    clears: AtomicUsize,
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clears(&self, fail: bool) {
        self.fail_clears.store(fail, Ordering::SeqCst);
    }

    /// Pretend the file was deleted from the fabric: clearing its
    /// markers answers `FileMissing`.
    pub fn remove_file(&self, file: &FileId) {
        self.missing.lock().unwrap().insert(file.clone());
        self.markers.lock().unwrap().retain(|(_, f, _), _| f != file);
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn marker_count(&self) -> usize {
        self.markers.lock().unwrap().len()
    }

    pub fn has_marker(&self, pool: &PoolName, file: &FileId, marker: &StickyMarker) -> bool {
        self.markers
            .lock()
            .unwrap()
            .contains_key(&(pool.clone(), file.clone(), marker.as_str().to_owned()))
    }

    pub fn marker_expiry(
        &self,
        pool: &PoolName,
        file: &FileId,
        marker: &StickyMarker,
    ) -> Option<Expiry> {
        self.markers
            .lock()
            .unwrap()
            .get(&(pool.clone(), file.clone(), marker.as_str().to_owned()))
            .copied()
    }
}

#[async_trait]
impl Pool for FakePool {
    async fn set_sticky(
        &self,
        pool: &PoolName,
        file: &FileId,
        marker: &StickyMarker,
        expiry: Expiry,
        on: bool,
    ) -> Result<(), RemoteError> {
        let key = (pool.clone(), file.clone(), marker.as_str().to_owned());
        if on {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_installs.load(Ordering::SeqCst) {
                return Err(RemoteError::Failed(format!("pool {} unreachable", pool)));
            }
            if self.missing.lock().unwrap().contains(file) {
                return Err(RemoteError::FileMissing);
            }
            self.markers.lock().unwrap().insert(key, expiry);
        } else {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if self.missing.lock().unwrap().contains(file) {
                return Err(RemoteError::FileMissing);
            }
            if self.fail_clears.load(Ordering::SeqCst) {
                return Err(RemoteError::Failed(format!("pool {} unreachable", pool)));
            }
            self.markers.lock().unwrap().remove(&key);
        }
        Ok(())
    }
}
