use std::sync::Arc;

use cacheout::config::CoordinatorConfig;
use cacheout::coordinator::Coordinator;
use cacheout::error::CoordinatorError;
use cacheout::ledger::{Credits, EntryKind, Ledger};
use cacheout::store::{MemoryStore, Store, WriteBatch};
use chrono::Utc;

fn credits(amount: f64) -> Credits {
    Credits::from_credits(amount).unwrap()
}

fn coordinator() -> Coordinator {
    Coordinator::in_memory(CoordinatorConfig::default())
}

#[tokio::test]
async fn test_first_touch_grants_starting_balance_once() {
    let c = coordinator();
    assert_eq!(c.get_balance("alice").await.unwrap(), credits(100.0));
    assert!(c.debit("alice", credits(10.0)).await.unwrap());
    // A second reference must not re-grant the starting balance.
    assert_eq!(c.get_balance("alice").await.unwrap(), credits(90.0));

    let entries = c.ledger_entries("alice").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, EntryKind::Open);
    assert_eq!(entries[1].kind, EntryKind::Debit);
    assert_eq!(entries[1].balance_after, credits(90.0));
}

#[tokio::test]
async fn test_debit_more_than_balance_changes_nothing() {
    let c = coordinator();
    assert!(!c.debit("bob", credits(150.0)).await.unwrap());
    assert_eq!(c.get_balance("bob").await.unwrap(), credits(100.0));
}

#[tokio::test]
async fn test_zero_amounts_rejected() {
    let c = coordinator();
    assert!(!c.debit("carol", Credits::ZERO).await.unwrap());
    assert!(!c.credit("carol", Credits::ZERO).await.unwrap());
    assert!(!c.transfer("carol", "dave", Credits::ZERO).await.unwrap());
}

#[tokio::test]
async fn test_credit_increases_balance() {
    let c = coordinator();
    assert!(c.credit("erin", credits(2.5)).await.unwrap());
    assert_eq!(c.get_balance("erin").await.unwrap(), credits(102.5));
}

#[tokio::test]
async fn test_transfer_moves_credits_and_conserves_total() {
    let c = coordinator();
    c.get_balance("a").await.unwrap();
    c.get_balance("b").await.unwrap();

    assert!(c.transfer("a", "b", credits(30.0)).await.unwrap());
    assert_eq!(c.get_balance("a").await.unwrap(), credits(70.0));
    assert_eq!(c.get_balance("b").await.unwrap(), credits(130.0));

    let total: u64 = c.all_balances().await.values().map(|b| b.micros()).sum();
    assert_eq!(total, credits(200.0).micros());
}

#[tokio::test]
async fn test_transfer_with_insufficient_funds_changes_neither_side() {
    let c = coordinator();
    assert!(!c.transfer("a", "b", credits(100.01)).await.unwrap());
    assert_eq!(c.get_balance("a").await.unwrap(), credits(100.0));
    assert_eq!(c.get_balance("b").await.unwrap(), credits(100.0));
}

#[tokio::test]
async fn test_transfer_to_same_account_rejected() {
    let c = coordinator();
    assert!(!c.transfer("a", "a", credits(1.0)).await.unwrap());
    assert_eq!(c.get_balance("a").await.unwrap(), credits(100.0));
}

#[tokio::test]
async fn test_transfer_store_failure_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let c = Coordinator::open(store.clone(), CoordinatorConfig::default())
        .await
        .unwrap();
    c.get_balance("a").await.unwrap();
    c.get_balance("b").await.unwrap();

    store.fail_next_writes(1);
    let err = c.transfer("a", "b", credits(40.0)).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Storage(_)));

    assert_eq!(c.get_balance("a").await.unwrap(), credits(100.0));
    assert_eq!(c.get_balance("b").await.unwrap(), credits(100.0));
    let durable = store.load().await.unwrap();
    assert_eq!(durable.accounts["a"].balance, credits(100.0));
    assert_eq!(durable.accounts["b"].balance, credits(100.0));
    assert!(!c.is_degraded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_total() {
    let c = Arc::new(coordinator());
    let accounts = ["x", "y", "z"];
    for a in accounts {
        c.get_balance(a).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..60 {
        let c = c.clone();
        handles.push(tokio::spawn(async move {
            let from = accounts[i % 3];
            let to = accounts[(i + 1) % 3];
            c.transfer(from, to, Credits::from_micros(1_000_000 + i as u64))
                .await
                .unwrap()
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let balances = c.all_balances().await;
    let total: u64 = balances.values().map(|b| b.micros()).sum();
    assert_eq!(total, credits(300.0).micros());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let c = Arc::new(coordinator());
    c.get_balance("spender").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..25 {
        let c = c.clone();
        handles.push(tokio::spawn(async move {
            c.debit("spender", credits(7.0)).await.unwrap()
        }));
    }
    let mut successes = 0;
    for h in handles {
        if h.await.unwrap() {
            successes += 1;
        }
    }

    // 14 * 7 = 98 fits into 100, a 15th would not.
    assert_eq!(successes, 14);
    assert_eq!(c.get_balance("spender").await.unwrap(), credits(2.0));
}

#[tokio::test]
async fn test_entries_for_unknown_account() {
    let c = coordinator();
    assert!(matches!(
        c.ledger_entries("ghost").await,
        Err(CoordinatorError::AccountNotFound(_))
    ));
}

#[test]
fn test_staged_writes_invisible_until_applied() {
    let mut ledger = Ledger::new(credits(10.0));
    let mut batch = WriteBatch::new();
    let now = Utc::now();

    assert!(ledger.debit(&mut batch, "a", credits(4.0), None, now));
    assert!(ledger.balance("a").is_none());
    // The staged debit is visible to later staging in the same batch.
    assert!(!ledger.debit(&mut batch, "a", credits(7.0), None, now));

    ledger.apply(&batch);
    assert_eq!(ledger.balance("a"), Some(credits(6.0)));
}
