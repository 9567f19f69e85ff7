//! Exactly-once confirmation resolution under concurrency, including two
//! store handles on one database file — the multi-instance deployment
//! shape.

use chrono::Utc;
use serde_json::json;

use switchboard_core::confirm::ConfirmationStore;
use switchboard_core::errors::GatewayError;
use switchboard_core::model::DeferredAction;
use switchboard_core::store::ControlStore;

fn action() -> DeferredAction {
    DeferredAction {
        server: "finance".to_string(),
        tool: "delete_invoice".to_string(),
        arguments: json!({ "invoice_id": 42 }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.db");

    let store = ConfirmationStore::new(ControlStore::open(&path).unwrap());
    let pending = store
        .create("user-1", "Delete invoice 42", action(), Utc::now())
        .unwrap();

    // Two independent handles to the same database file, as two gateway
    // instances would hold.
    let handles: Vec<ConfirmationStore> = (0..2)
        .map(|_| ConfirmationStore::new(ControlStore::open(&path).unwrap()))
        .collect();

    let mut tasks = Vec::new();
    for store in handles {
        for _ in 0..4 {
            let store = store.clone();
            let id = pending.id.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                store.claim(&id, "user-1", Utc::now())
            }));
        }
    }

    let mut winners = 0;
    let mut losers = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(claimed) => {
                winners += 1;
                assert_eq!(claimed.action, action());
            }
            Err(GatewayError::ConfirmationExpired) => losers += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(winners, 1, "exactly one claimant may execute the action");
    assert_eq!(losers, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approve_and_deny_race_resolves_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.db");

    let store = ConfirmationStore::new(ControlStore::open(&path).unwrap());
    let pending = store
        .create("user-1", "Delete invoice 42", action(), Utc::now())
        .unwrap();

    let approve_store = ConfirmationStore::new(ControlStore::open(&path).unwrap());
    let deny_store = ConfirmationStore::new(ControlStore::open(&path).unwrap());
    let id_a = pending.id.clone();
    let id_d = pending.id.clone();

    let approve = tokio::task::spawn_blocking(move || approve_store.claim(&id_a, "user-1", Utc::now()));
    let deny = tokio::task::spawn_blocking(move || deny_store.claim(&id_d, "user-1", Utc::now()));

    let results = [approve.await.unwrap(), deny.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "approve and deny cannot both claim the entry");
}

#[test]
fn foreign_subject_never_wins_a_race() {
    let store = ConfirmationStore::new(ControlStore::memory().unwrap());
    let pending = store
        .create("user-1", "Delete invoice 42", action(), Utc::now())
        .unwrap();

    // The attacker loses without consuming the entry.
    for _ in 0..3 {
        assert!(matches!(
            store.claim(&pending.id, "attacker", Utc::now()),
            Err(GatewayError::ConfirmationForbidden)
        ));
    }
    // The owner still holds their window.
    assert!(store.claim(&pending.id, "user-1", Utc::now()).is_ok());
}
