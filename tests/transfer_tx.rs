//! Transfer engine against the in-memory store

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use ledgerd::store::{ErrorKind, ListEntriesParams, MemoryStore, Store, TransferTxParams};

use common::{balance_of, init_tracing, seed_pair};

fn transfer(from: i64, to: i64, amount: i64) -> TransferTxParams {
    TransferTxParams {
        from_account_id: from,
        to_account_id: to,
        amount,
    }
}

#[tokio::test]
async fn test_transfer_conserves_funds() {
    init_tracing();
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    let result = store.transfer_tx(transfer(a.id, b.id, 30)).await.unwrap();

    assert_eq!(result.transfer.from_account_id, a.id);
    assert_eq!(result.transfer.to_account_id, b.id);
    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 130);
    assert_eq!(
        result.from_account.balance + result.to_account.balance,
        a.balance + b.balance
    );

    // Each transfer has exactly two entries that cancel out
    assert_eq!(result.from_entry.account_id, a.id);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.account_id, b.id);
    assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
    assert_eq!(store.ledger_counts().await, (1, 2));

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(conn.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
    let entries = conn
        .list_entries(ListEntriesParams {
            account_id: b.id,
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(entries, vec![result.to_entry.clone()]);
}

#[tokio::test]
async fn test_concurrent_transfers_same_direction() {
    init_tracing();
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    let n = 5;
    let amount = 10;
    let (from, to) = (a.id, b.id);
    let mut handles = Vec::new();
    for _ in 0..n {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.transfer_tx(transfer(from, to, amount)).await
        }));
    }

    let mut deltas = BTreeSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        let from_delta = a.balance - result.from_account.balance;
        let to_delta = result.to_account.balance - b.balance;
        assert_eq!(from_delta, to_delta);
        assert_eq!(from_delta % amount, 0);
        deltas.insert(from_delta);
    }

    // Every transfer saw a distinct cumulative state
    assert_eq!(deltas, BTreeSet::from([10, 20, 30, 40, 50]));
    assert_eq!(balance_of(&store, a.id).await, 50);
    assert_eq!(balance_of(&store, b.id).await, 150);
    assert_eq!(store.ledger_counts().await, (5, 10));
}

#[tokio::test]
async fn test_concurrent_transfers_opposite_directions() {
    init_tracing();
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        handles.push(tokio::spawn(async move {
            store.transfer_tx(transfer(from, to, 10)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance_of(&store, a.id).await, 100);
    assert_eq!(balance_of(&store, b.id).await, 100);
}

#[tokio::test]
async fn test_balance_updates_lock_lower_id_first() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;
    let (low, high) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };

    store.clear_balance_update_log();
    store.transfer_tx(transfer(low, high, 10)).await.unwrap();
    store.transfer_tx(transfer(high, low, 10)).await.unwrap();

    assert_eq!(store.balance_update_log(), vec![low, high, low, high]);
}

#[tokio::test]
async fn test_overdraft_leaves_ledger_unchanged() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    let err = store
        .transfer_tx(transfer(a.id, b.id, 150))
        .await
        .unwrap_err();

    assert!(err.is_check_violation(), "{err}");
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(balance_of(&store, a.id).await, 100);
    assert_eq!(balance_of(&store, b.id).await, 100);
    assert_eq!(store.ledger_counts().await, (0, 0));
}

#[tokio::test]
async fn test_overdraft_on_higher_id_account_rolls_back_first_update() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;
    let (low, high) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };

    // The credit to the lower id lands first; the debit then fails
    let err = store
        .transfer_tx(transfer(high, low, 101))
        .await
        .unwrap_err();

    assert!(err.is_check_violation());
    assert_eq!(balance_of(&store, low).await, 100);
    assert_eq!(balance_of(&store, high).await, 100);
}

#[tokio::test]
async fn test_invalid_requests_rejected_before_any_write() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    for params in [
        transfer(a.id, b.id, 0),
        transfer(a.id, b.id, -5),
        transfer(a.id, a.id, 10),
    ] {
        let err = store.transfer_tx(params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{params:?}");
        assert_eq!(err.http_status(), 400);
    }
    assert_eq!(store.ledger_counts().await, (0, 0));
}

#[tokio::test]
async fn test_unknown_account_fails_cleanly() {
    let store = MemoryStore::new();
    let (a, _) = seed_pair(&store, 100).await;

    let err = store
        .transfer_tx(transfer(a.id, 9_999, 10))
        .await
        .unwrap_err();

    assert!(err.is_foreign_key_violation() || err.is_not_found(), "{err}");
    assert_eq!(balance_of(&store, a.id).await, 100);
    assert_eq!(store.ledger_counts().await, (0, 0));
}

#[tokio::test]
async fn test_deadline_abandons_transfer_without_writes() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    // Hold the store's write lock so the transfer cannot begin
    let blocker = store.begin().await.unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        store.transfer_tx(transfer(a.id, b.id, 10)),
    )
    .await;
    assert!(outcome.is_err(), "transfer should have hit the deadline");
    drop(blocker);

    assert_eq!(balance_of(&store, a.id).await, 100);
    assert_eq!(store.ledger_counts().await, (0, 0));

    // The store is still usable afterwards
    store.transfer_tx(transfer(a.id, b.id, 10)).await.unwrap();
    assert_eq!(balance_of(&store, a.id).await, 90);
}

#[tokio::test]
async fn test_failed_commit_surfaces_transient_error() {
    let store = MemoryStore::new();
    let (a, b) = seed_pair(&store, 100).await;

    store.fail_next_commit();
    let err = store
        .transfer_tx(transfer(a.id, b.id, 10))
        .await
        .unwrap_err();

    assert!(err.is_transient(), "{err}");
    assert_eq!(balance_of(&store, a.id).await, 100);
}
