//! Repin and sweeper behavior: everything that repairs state after a
//! worker failure or a crash.

use gridpin_core::testutil::{FakeNamespace, FakePool, FakePoolManager};
use gridpin_core::{Expiry, FileId, PinState, PoolName};
use gridpin_node::{ExtendArgs, NodeConfig, PinArgs, PinCoordinator, RequestError, Sweeper};
use gridpin_store::PinStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

struct Harness {
    _dir: TempDir,
    coordinator: Arc<PinCoordinator>,
    namespace: Arc<FakeNamespace>,
    pool_manager: Arc<FakePoolManager>,
    pools: Arc<FakePool>,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let namespace = Arc::new(FakeNamespace::new());
    let pool_manager = Arc::new(FakePoolManager::new(pool("pool_a")));
    let pools = Arc::new(FakePool::new());
    let config = NodeConfig {
        remote_timeout_secs: 5,
        ..NodeConfig::default()
    };
    let coordinator = PinCoordinator::new(
        store,
        namespace.clone(),
        pool_manager.clone(),
        pools.clone(),
        &config,
    );
    Harness {
        _dir: dir,
        coordinator,
        namespace,
        pool_manager,
        pools,
    }
}

fn sweeper(h: &Harness) -> Sweeper {
    Sweeper::new(h.coordinator.clone(), Duration::from_secs(60))
}

fn pool(name: &str) -> PoolName {
    PoolName::new(name).unwrap()
}

fn file(id: &str) -> FileId {
    FileId::new(id).unwrap()
}

fn pin_args(file: &str, lease_seconds: i64) -> PinArgs {
    PinArgs {
        file: file.into(),
        lease_seconds,
        correlation_id: None,
        owner: None,
    }
}

/// Lets the spawned workers and callbacks drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn failed_extend_attempts_a_repin_and_parks_in_error() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);

    let grant = h.coordinator.pin(pin_args("F1", 3600)).await.unwrap();

    // The pool stops answering: the extend fails, the repin's pinner
    // fails too, and the pin parks in Error for the sweeper.
    h.pools.fail_installs(true);
    let err = h
        .coordinator
        .extend(ExtendArgs {
            file: "F1".into(),
            request_id: grant.request_id.0,
            lease_seconds: 7200,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Failed(_)), "got {err:?}");
    settle().await;

    let pins = h.coordinator.store().pins_for_file(&f).unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].state, PinState::Error);
    // The confirmed lease survives the failed upgrade.
    assert_eq!(
        h.coordinator
            .store()
            .requests_for_pin(pins[0].id.0)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn sweeper_repins_error_pins_and_cleans_the_leftovers() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);

    let grant = h.coordinator.pin(pin_args("F1", 3600)).await.unwrap();
    h.pools.fail_installs(true);
    let _ = h
        .coordinator
        .extend(ExtendArgs {
            file: "F1".into(),
            request_id: grant.request_id.0,
            lease_seconds: 7200,
        })
        .await;
    settle().await;

    // The pool recovers; the next sweep repins and the cycle after it
    // clears the stripped pin's marker.
    h.pools.fail_installs(false);
    h.pool_manager.set_pool(pool("pool_b"));
    let sweeper = sweeper(&h);
    sweeper.run_once().await;
    settle().await;

    let pins = h.coordinator.store().pins_for_file(&f).unwrap();
    let pinned: Vec<_> = pins.iter().filter(|p| p.state == PinState::Pinned).collect();
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].pool, Some(pool("pool_b")));
    // The lease moved onto the replacement pin.
    assert_eq!(
        h.coordinator
            .store()
            .requests_for_pin(pinned[0].id.0)
            .unwrap()
            .len(),
        1
    );

    sweeper.run_once().await;
    settle().await;
    let pins = h.coordinator.store().pins_for_file(&f).unwrap();
    assert_eq!(pins.len(), 1, "stripped pin should be gone, got {pins:?}");
    assert_eq!(pins[0].state, PinState::Pinned);
}

#[tokio::test]
async fn sweeper_releases_expired_leases() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);

    h.coordinator.pin(pin_args("F1", 3600)).await.unwrap();

    // Simulate the lease running out.
    let store = h.coordinator.store().clone();
    let pin = store.pins_for_file(&f).unwrap().remove(0);
    let request = store.requests_for_pin(pin.id.0).unwrap().remove(0);
    let mut txn = store.begin(&f).await.unwrap();
    txn.update_request_expiry(request.id, Expiry::At(1)).unwrap();
    txn.update_pin(pin.id, Some(Expiry::At(1)), None, None, 1).unwrap();
    txn.commit().unwrap();

    sweeper(&h).run_once().await;
    settle().await;

    assert!(h.coordinator.store().all_pins().unwrap().is_empty());
    assert_eq!(h.pools.marker_count(), 0);
}

#[tokio::test]
async fn sweeper_retries_failed_unpinnings() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);

    h.coordinator.pin(pin_args("F1", 3600)).await.unwrap();

    // First unpin attempt cannot reach the pool.
    h.pools.fail_clears(true);
    let err = h
        .coordinator
        .unpin(gridpin_node::UnpinArgs {
            file: "F1".into(),
            request_id: None,
            correlation_id: None,
            requester: None,
            force: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Failed(_)), "got {err:?}");
    settle().await;

    let pins = h.coordinator.store().pins_for_file(&f).unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].state, PinState::UnpinningFailed);
    assert_eq!(h.pools.marker_count(), 1);

    // The pool recovers; the sweeper finishes the job. The client is
    // not involved again.
    h.pools.fail_clears(false);
    sweeper(&h).run_once().await;
    settle().await;

    assert!(h.coordinator.store().all_pins().unwrap().is_empty());
    assert_eq!(h.pools.marker_count(), 0);
}

#[tokio::test]
async fn sweeper_marks_expired_unfinished_pins() {
    let h = harness();
    let f = file("F1");

    // A Pinning pin whose expiry passed with no leases left, as a crash
    // or a lost worker would leave it.
    let store = h.coordinator.store().clone();
    let mut txn = store.begin(&f).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    txn.update_pin(pin.id, Some(Expiry::At(2_000)), None, Some(PinState::Pinning), 1_000)
        .unwrap();
    txn.commit().unwrap();

    sweeper(&h).run_once().await;
    settle().await;

    let pins = store.pins_for_file(&f).unwrap();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].state, PinState::Expired);

    // The next cycle removes whatever marker might exist and drops the
    // row.
    h.namespace.add_file(&f, 1);
    sweeper(&h).run_once().await;
    settle().await;
    assert!(store.pins_for_file(&f).unwrap().is_empty());
}

#[tokio::test]
async fn startup_drains_pins_left_by_a_crash() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);

    // A Pinning pin with a lease, mid-flight at crash time.
    let store = h.coordinator.store().clone();
    let mut txn = store.begin(&f).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    txn.insert_request(pin.id, Expiry::Never, None, None, 1_000)
        .unwrap();
    txn.update_pin(pin.id, Some(Expiry::Never), None, Some(PinState::Pinning), 1_000)
        .unwrap();
    txn.commit().unwrap();

    // `start` drains before handing back control, then keeps sweeping
    // in the background.
    let _sweeper = gridpin_node::start(h.coordinator.clone(), &NodeConfig::default()).await;
    settle().await;

    assert!(store.all_pins().unwrap().is_empty());
}

#[tokio::test]
async fn late_pinner_confirmation_of_an_expired_pin_is_refused() {
    let h = harness();
    let f = file("F1");
    h.namespace.add_file(&f, 1);
    h.namespace.set_lookup_delay(Duration::from_millis(200));

    // Let the pin expire while the pinner is still on the wire.
    let c = h.coordinator.clone();
    let pinning = tokio::spawn(async move { c.pin(pin_args("F1", 3600)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = h.coordinator.store().clone();
    let pin = store.pins_for_file(&f).unwrap().remove(0);
    assert_eq!(pin.state, PinState::Pinning);
    let mut txn = store.begin(&f).await.unwrap();
    txn.update_pin(pin.id, None, None, Some(PinState::Expired), 1_000)
        .unwrap();
    txn.commit().unwrap();

    // The caller gets a failure, the marker is removed again and the
    // rows are gone.
    let err = pinning.await.unwrap().unwrap_err();
    assert!(matches!(err, RequestError::Failed(_)), "got {err:?}");
    settle().await;
    assert!(store.pins_for_file(&f).unwrap().is_empty());
    assert_eq!(h.pools.marker_count(), 0);
}
