//! A storage fault on one pair must not stop the rest of the batch.

mod helpers;

use std::sync::Arc;

use serde_json::json;

use helpers::*;
use secure_groups::api::{LogAction, MembershipStatus};
use secure_groups::eligibility::{BatchOrchestrator, RunContext};
use secure_groups::store::{MembershipStore, Stores};
use secure_groups::store_memory::MemoryStore;
use secure_groups::{EngineConfig, EngineError};

async fn three_users() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(group(1)).await;
    store
        .seed_filter(filter(10, "alt_corp", json!({"corporation_id": CORP})))
        .await;
    store.seed_chain(vec![entry(1, 10, 1)]).await;
    for user_id in [1, 2, 3] {
        seed_character(&store, user_id, user_id * 10, Some(CORP), None).await;
    }
    store
}

fn failing_stores(store: &Arc<MemoryStore>, fail_user: i64) -> Stores {
    Stores::from_backend(store.clone())
        .with_memberships(Arc::new(FailingMemberships::always(store.clone(), fail_user)))
}

#[tokio::test]
async fn failed_pair_is_counted_and_others_applied() {
    let store = three_users().await;
    let orchestrator = BatchOrchestrator::new(failing_stores(&store, 2), EngineConfig::default());

    let report = orchestrator
        .evaluate_all(&RunContext::new("cron"))
        .await
        .expect("batch itself succeeds");

    assert_eq!(report.pairs_processed, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert!(report.has_failures());
    assert_eq!(report.failures[0].group_id, 1);
    assert_eq!(report.failures[0].user_id, 2);
    assert!(report.failures[0].error.contains("upsert membership"));

    for user_id in [1, 3] {
        let m = store.get_membership(1, user_id).await.unwrap().unwrap();
        assert_eq!(m.status, MembershipStatus::In);
    }
    assert!(store.get_membership(1, 2).await.unwrap().is_none());
    // The idempotent sync ran before the row write failed.
    assert_eq!(store.permission_members(100).await.len(), 3);
}

#[tokio::test]
async fn concurrent_batch_isolates_failures_too() {
    let store = three_users().await;
    let config = EngineConfig::default().with_max_concurrency(3);
    let orchestrator = BatchOrchestrator::new(failing_stores(&store, 3), config);

    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].user_id, 3);
}

#[tokio::test]
async fn single_pair_surfaces_storage_error() {
    let store = three_users().await;
    let orchestrator = BatchOrchestrator::new(failing_stores(&store, 2), EngineConfig::default());

    let err = orchestrator
        .evaluate_pair(1, 2, &RunContext::new("admin"))
        .await
        .unwrap_err();
    assert!(err.is_storage());
    assert!(matches!(err, EngineError::Storage(_)));
}

async fn actions(store: &MemoryStore, user_id: i64) -> Vec<LogAction> {
    store
        .list_group_logs(1)
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.user_id == user_id)
        .map(|l| l.action)
        .collect()
}

#[tokio::test]
async fn failed_permission_sync_is_logged_on_the_next_run() {
    let store = three_users().await;
    let stores = Stores::from_backend(store.clone())
        .with_permissions(Arc::new(FlakyPermissions::failing_adds(store.clone(), 1)));
    let orchestrator = BatchOrchestrator::new(stores, EngineConfig::default());

    let first = orchestrator.evaluate_pair(1, 1, &RunContext::new("cron")).await;
    assert!(first.unwrap_err().is_storage());
    assert!(store.get_membership(1, 1).await.unwrap().is_none());
    assert!(actions(&store, 1).await.is_empty());

    let second = orchestrator.evaluate_pair(1, 1, &RunContext::new("cron")).await.unwrap();
    assert!(second.changed);
    assert_eq!(second.status, MembershipStatus::In);
    assert_eq!(actions(&store, 1).await, vec![LogAction::Add]);
    assert_eq!(store.list_user_notifications(1).await.unwrap().len(), 1);
    assert!(store.permission_members(100).await.contains(&1));
}

#[tokio::test]
async fn failed_log_write_is_retried_once() {
    let store = three_users().await;
    let stores = Stores::from_backend(store.clone()).with_memberships(Arc::new(
        FailingMemberships::new(store.clone(), 2).failing_logs(1),
    ));
    let orchestrator = BatchOrchestrator::new(stores, EngineConfig::default());

    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].error.contains("append membership log"));
    assert!(store.get_membership(1, 2).await.unwrap().is_none());

    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(report.status_changes, 1);
    assert_eq!(actions(&store, 2).await, vec![LogAction::Add]);
    assert_eq!(
        store.get_membership(1, 2).await.unwrap().unwrap().status,
        MembershipStatus::In
    );
}

#[tokio::test]
async fn failed_row_write_after_logging_does_not_log_twice() {
    let store = three_users().await;
    let stores = Stores::from_backend(store.clone()).with_memberships(Arc::new(
        FailingMemberships::new(store.clone(), 3).failing_upserts(1),
    ));
    let orchestrator = BatchOrchestrator::new(stores, EngineConfig::default());

    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(actions(&store, 3).await, vec![LogAction::Add]);

    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(actions(&store, 3).await, vec![LogAction::Add]);
    assert_eq!(store.list_user_notifications(3).await.unwrap().len(), 1);
    assert_eq!(
        store.get_membership(1, 3).await.unwrap().unwrap().status,
        MembershipStatus::In
    );

    // Later runs with the same facts stay quiet.
    let report = orchestrator.evaluate_all(&RunContext::new("cron")).await.unwrap();
    assert_eq!(report.status_changes, 0);
    assert_eq!(actions(&store, 3).await.len(), 1);
}
