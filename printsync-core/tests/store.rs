use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use printsync_core::allocate::Allocation;
use printsync_core::contract::{
    AccountRef, DispatchMode, DispatchStatus, LedgerStore, NewDispatchRecord,
    NewLedgerTransaction,
};
use printsync_core::store::MemoryLedger;
use uuid::Uuid;

fn record(status: DispatchStatus) -> NewDispatchRecord {
    NewDispatchRecord {
        account: "acct".to_string(),
        document_id: 1,
        document_name: "doc".to_string(),
        requested_by: "alice".to_string(),
        mode: DispatchMode::Auto,
        printer: "color1".to_string(),
        job_prefix: "ps_acct_1".to_string(),
        allocation: Allocation::default(),
        cost_cents: 100,
        grayscale: false,
        status,
        created_at: Utc::now(),
        expires_at: None,
    }
}

fn charge(dispatch_id: Uuid, amount_cents: i64) -> NewLedgerTransaction {
    NewLedgerTransaction {
        account: AccountRef::User("alice".to_string()),
        amount_cents,
        weight: 1,
        weight_unit: 1,
        narrative: "print doc".to_string(),
        dispatch_id,
    }
}

#[tokio::test]
async fn staged_operations_are_invisible_until_commit() {
    let store = MemoryLedger::new();
    store.ensure_user("alice", "alice").await.unwrap();

    let txn = store.begin().await.unwrap();
    let id = store.insert_dispatch(txn, record(DispatchStatus::Submitted)).await.unwrap();
    store.insert_transactions(txn, vec![charge(id, -100)]).await.unwrap();

    assert!(store.dispatch(id).is_none(), "uncommitted dispatch must be invisible");
    assert_eq!(store.user_balance("alice"), Some(0));

    store.commit(txn).await.unwrap();
    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Submitted);
    assert_eq!(store.user_balance("alice"), Some(-100));
}

#[tokio::test]
async fn rollback_discards_everything() {
    let store = MemoryLedger::new();
    store.ensure_user("alice", "alice").await.unwrap();

    let txn = store.begin().await.unwrap();
    let id = store.insert_dispatch(txn, record(DispatchStatus::Submitted)).await.unwrap();
    store.insert_transactions(txn, vec![charge(id, -100)]).await.unwrap();
    store.rollback(txn).await.unwrap();

    assert!(store.dispatch(id).is_none());
    assert_eq!(store.user_balance("alice"), Some(0));
    assert!(store.transactions().is_empty());

    let result = store.commit(txn).await;
    assert!(result.is_err(), "a rolled-back transaction cannot be committed");
}

#[tokio::test]
async fn terminal_statuses_stick() {
    let store = MemoryLedger::new();
    store.ensure_user("alice", "alice").await.unwrap();

    let txn = store.begin().await.unwrap();
    let id = store.insert_dispatch(txn, record(DispatchStatus::Submitted)).await.unwrap();
    store.commit(txn).await.unwrap();

    let txn = store.begin().await.unwrap();
    let effective = store
        .update_dispatch_status(txn, id, DispatchStatus::Completed)
        .await
        .unwrap();
    assert_eq!(effective, DispatchStatus::Completed);
    store.commit(txn).await.unwrap();

    // A different terminal status must not replace the first one.
    let txn = store.begin().await.unwrap();
    let effective = store
        .update_dispatch_status(txn, id, DispatchStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(effective, DispatchStatus::Completed, "terminal states never revert");
    store.commit(txn).await.unwrap();
    assert_eq!(store.dispatch(id).unwrap().status, DispatchStatus::Completed);
}

#[tokio::test]
async fn unreported_terminal_tracks_the_reporting_flag() {
    let store = MemoryLedger::new();
    store.ensure_user("alice", "alice").await.unwrap();

    let txn = store.begin().await.unwrap();
    let id = store.insert_dispatch(txn, record(DispatchStatus::Completed)).await.unwrap();
    store.commit(txn).await.unwrap();

    let unreported = store.unreported_terminal("acct").await.unwrap();
    assert_eq!(unreported.len(), 1);
    assert_eq!(unreported[0].id, id);

    store.mark_reported(id).await.unwrap();
    assert!(store.unreported_terminal("acct").await.unwrap().is_empty());
}

#[tokio::test]
async fn user_row_locks_serialize_concurrent_transactions() {
    let store = Arc::new(MemoryLedger::new());
    store.ensure_user("alice", "alice").await.unwrap();

    let txn_a = store.begin().await.unwrap();
    store.lock_user(txn_a, "alice").await.unwrap();

    // A second transaction must block on the row until the first commits.
    let contender = {
        let store = store.clone();
        tokio::spawn(async move {
            let txn_b = store.begin().await.unwrap();
            store.lock_user(txn_b, "alice").await.unwrap();
            store.commit(txn_b).await.unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished(), "the row lock must still be held");

    store.commit(txn_a).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), contender)
        .await
        .expect("the contender must acquire the lock after commit")
        .unwrap();
}

#[tokio::test]
async fn locking_an_unknown_user_fails() {
    let store = MemoryLedger::new();
    let txn = store.begin().await.unwrap();
    assert!(store.lock_user(txn, "nobody").await.is_err());
    store.rollback(txn).await.unwrap();
}
