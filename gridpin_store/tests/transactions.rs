use gridpin_core::{Expiry, FileId, Owner, PinState};
use gridpin_store::PinStore;
use tempfile::tempdir;

fn file(id: &str) -> FileId {
    FileId::new(id).unwrap()
}

#[tokio::test]
async fn reserve_creates_one_active_pin_per_file() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (pin, created) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    assert!(created);
    assert_eq!(pin.state, PinState::Initial);
    txn.commit().unwrap();

    // A second transaction finds the same row instead of reserving.
    let mut txn = store.begin(&f).await.unwrap();
    let (again, created) = txn.reserve_or_get_active_pin(&f, 2_000).unwrap();
    assert!(!created);
    assert_eq!(again.id, pin.id);
    txn.rollback();

    // Once the pin leaves the active states, a new reservation is made.
    let mut txn = store.begin(&f).await.unwrap();
    txn.update_pin(pin.id, None, None, Some(PinState::Unpinning), 3_000)
        .unwrap();
    let (fresh, created) = txn.reserve_or_get_active_pin(&f, 3_000).unwrap();
    assert!(created);
    assert_ne!(fresh.id, pin.id);
    txn.commit().unwrap();

    assert_eq!(store.pins_for_file(&f).unwrap().len(), 2);
}

#[tokio::test]
async fn rollback_discards_staged_rows() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    txn.insert_request(pin.id, Expiry::At(10_000), None, None, 1_000)
        .unwrap();
    txn.rollback();

    assert!(store.pins_for_file(&f).unwrap().is_empty());
    assert!(store.all_pins().unwrap().is_empty());
}

#[tokio::test]
async fn staged_writes_are_visible_within_the_transaction() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    let request = txn
        .insert_request(pin.id, Expiry::At(10_000), Some(7), Some(Owner::new("alice")), 1_000)
        .unwrap();

    let (owning, found) = txn.pin_by_request(request.id).unwrap().unwrap();
    assert_eq!(owning.id, pin.id);
    assert_eq!(found.id, request.id);

    let by_corr = txn.request_by_correlation(&f, 7).unwrap().unwrap();
    assert_eq!(by_corr.id, request.id);
    assert!(txn.request_by_correlation(&f, 8).unwrap().is_none());

    txn.delete_request(request.id).unwrap();
    assert!(txn.requests_for_pin(pin.id).unwrap().is_empty());
    txn.commit().unwrap();
}

#[tokio::test]
async fn move_request_reattaches_to_new_pin() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (old, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    let request = txn
        .insert_request(old.id, Expiry::Never, None, None, 1_000)
        .unwrap();
    let new = txn
        .insert_pin(&f, Expiry::Never, None, PinState::Moving, 1_000)
        .unwrap();
    txn.move_request(request.id, new.id).unwrap();
    txn.commit().unwrap();

    assert!(store.requests_for_pin(old.id.0).unwrap().is_empty());
    let moved = store.requests_for_pin(new.id.0).unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].id, request.id);
}

#[tokio::test]
async fn expiry_queries_find_stale_rows() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f1 = file("F1");
    let f2 = file("F2");

    let mut txn = store.begin(&f1).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f1, 1_000).unwrap();
    txn.update_pin(pin.id, Some(Expiry::At(5_000)), None, Some(PinState::Pinned), 1_000)
        .unwrap();
    txn.insert_request(pin.id, Expiry::At(5_000), None, None, 1_000)
        .unwrap();
    txn.commit().unwrap();

    // Orphan pin with no requests, already past its expiry.
    let mut txn = store.begin(&f2).await.unwrap();
    let (orphan, _) = txn.reserve_or_get_active_pin(&f2, 1_000).unwrap();
    txn.update_pin(orphan.id, Some(Expiry::At(2_000)), None, Some(PinState::Pinned), 1_000)
        .unwrap();
    txn.commit().unwrap();

    let expired = store.expired_requests(6_000).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].pin_id, pin.id);
    assert!(store.expired_requests(4_000).unwrap().is_empty());

    let orphans = store.expired_orphan_pins(6_000).unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, orphan.id);

    // The pin with a live request never shows up as an orphan.
    assert!(
        store
            .expired_orphan_pins(4_000)
            .unwrap()
            .iter()
            .all(|p| p.id != pin.id)
    );
}

#[tokio::test]
async fn state_queries() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    txn.update_pin(pin.id, None, None, Some(PinState::UnpinningFailed), 1_000)
        .unwrap();
    txn.commit().unwrap();

    let failed = store.pins_in_state(PinState::UnpinningFailed).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(store.pins_in_state(PinState::Pinned).unwrap().is_empty());

    // Not Pinned, so the startup inventory must report it.
    let incomplete = store.incomplete_pins().unwrap();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].id, pin.id);
}

#[tokio::test]
async fn ids_are_unique_across_reopen() {
    let dir = tempdir().unwrap();
    let f = file("F1");
    let first;
    {
        let store = PinStore::open(dir.path()).unwrap();
        let mut txn = store.begin(&f).await.unwrap();
        let (pin, _) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
        first = pin.id;
        txn.commit().unwrap();
    }

    let store = PinStore::open(dir.path()).unwrap();
    let mut txn = store.begin(&f).await.unwrap();
    let request = txn
        .insert_request(first, Expiry::Never, None, None, 2_000)
        .unwrap();
    txn.commit().unwrap();

    // A reopened store claims a fresh id batch; ids never repeat.
    assert!(request.id.0 > first.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_file_transactions_serialize() {
    let dir = tempdir().unwrap();
    let store = PinStore::open(dir.path()).unwrap();
    let f = file("F1");

    let mut txn = store.begin(&f).await.unwrap();
    let (pin, created) = txn.reserve_or_get_active_pin(&f, 1_000).unwrap();
    assert!(created);

    let store2 = store.clone();
    let f2 = f.clone();
    let racer = tokio::spawn(async move {
        // Blocks until the first transaction releases the file lock.
        let mut txn = store2.begin(&f2).await.unwrap();
        let (pin, created) = txn.reserve_or_get_active_pin(&f2, 2_000).unwrap();
        txn.rollback();
        (pin, created)
    });

    // Give the racer a chance to contend, then commit.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    txn.commit().unwrap();

    let (seen, created) = racer.await.unwrap();
    assert!(!created, "second transaction must see the committed pin");
    assert_eq!(seen.id, pin.id);
}
