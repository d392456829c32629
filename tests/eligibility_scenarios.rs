//! End-to-end eligibility scenarios against the in-memory store.
//!
//! Each test seeds groups, filters and facts, drives `BatchOrchestrator`, and
//! checks the stored membership rows, history and downstream permissions.

mod helpers;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use helpers::*;
use secure_groups::api::*;
use secure_groups::eligibility::{BatchOrchestrator, RunContext};
use secure_groups::store::{GroupCatalog, MembershipStore, Stores};
use secure_groups::store_memory::MemoryStore;
use secure_groups::EngineConfig;

fn engine(store: &Arc<MemoryStore>) -> BatchOrchestrator {
    BatchOrchestrator::new(Stores::from_backend(store.clone()), EngineConfig::default())
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

async fn corp_group_store(group: SecureGroup) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let group_id = group.group_id;
    store.seed_group(group).await;
    store
        .seed_filter(filter(10, "alt_corp", json!({"corporation_id": CORP})))
        .await;
    store.seed_chain(vec![entry(group_id, 10, 1)]).await;
    store
}

// ============================================================================
// Missing data and exemptions
// ============================================================================

#[tokio::test]
async fn missing_org_facts_fail_with_missing_data_message() {
    let store = corp_group_store(group(1)).await;
    // Character exists but the audit pipeline has no corp/alliance on record.
    seed_character(&store, 7, 70, None, None).await;

    let report = engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert_eq!(report.failed, 0);

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert_eq!(m.reason, "alt_corp-10: Missing corp or character data");
    assert_eq!(m.evidence[0].message, "Missing corp or character data");
    assert!(!m.evidence[0].pass);

    let cached = store.load_chain(1).await.unwrap();
    assert_eq!(cached[0].last_pass, Some(false));
    assert_eq!(cached[0].last_message.as_deref(), Some("Missing corp or character data"));
}

#[tokio::test]
async fn negated_missing_data_flips_like_any_result() {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(group(1)).await;
    store
        .seed_filter(filter(10, "alt_corp", json!({"corporation_id": CORP, "negate": true})))
        .await;
    store.seed_chain(vec![entry(1, 10, 1)]).await;
    store.seed_user(7).await;

    engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::In);
    assert!(m.evidence[0].negated);
    assert_eq!(m.evidence[0].message, "Negated: Missing corp or character data");
}

#[tokio::test]
async fn exempt_character_does_not_satisfy_corp_rule() {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(group(1)).await;
    store
        .seed_filter(filter(
            10,
            "alt_corp",
            json!({"corporation_id": CORP, "exempt_character_ids": [71]}),
        ))
        .await;
    store.seed_chain(vec![entry(1, 10, 1)]).await;
    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;
    seed_character(&store, 7, 71, Some(CORP), None).await;

    engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert!(m.reason.ends_with("No character in required corp"));

    // A non-exempt alt in the corp satisfies the rule.
    seed_character(&store, 7, 72, Some(CORP), Some(ALLIANCE)).await;
    engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::In);
    assert_eq!(m.evidence[0].message, "Character 72 in required corp");
    assert!(store.permission_members(100).await.contains(&7));
}

#[tokio::test]
async fn cyclic_expression_fails_closed() {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(group(1)).await;
    store
        .seed_filter(filter(20, "expression", json!({"left": 21, "right": 10, "operator": "OR"})))
        .await;
    store
        .seed_filter(filter(21, "expression", json!({"left": 20, "right": 10})))
        .await;
    store
        .seed_filter(filter(10, "alt_corp", json!({"corporation_id": CORP})))
        .await;
    store.seed_chain(vec![entry(1, 20, 1)]).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;

    let report = engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert_eq!(report.failed, 0);

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert!(m.reason.contains("Cycle detected at filter 20"), "{}", m.reason);
}

// ============================================================================
// Chain ordering
// ============================================================================

#[tokio::test]
async fn reordering_chain_changes_reported_reason() {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(group(1)).await;
    store
        .seed_filter(filter(10, "alt_corp", json!({"corporation_id": CORP})))
        .await;
    store
        .seed_filter(filter(11, "permission_group", json!({"group_ids": [555]})))
        .await;
    store.seed_chain(vec![entry(1, 10, 1), entry(1, 11, 2)]).await;
    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;

    engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    let first = store.get_membership(1, 7).await.unwrap().unwrap();
    assert!(first.reason.starts_with("alt_corp-10:"));
    assert_eq!(first.evidence.len(), 1);

    store.seed_chain(vec![entry(1, 10, 2), entry(1, 11, 1)]).await;
    engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    let second = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(second.status, MembershipStatus::Out);
    assert!(second.reason.starts_with("permission_group-11:"));
    assert_eq!(second.evidence[0].filter_id, 11);
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn repeated_runs_change_nothing() {
    let store = corp_group_store(grace_group(1, 3)).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    seed_character(&store, 8, 80, Some(OTHER_CORP), None).await;
    seed_character(&store, 9, 90, None, None).await;

    let orchestrator = engine(&store);
    let first = orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert_eq!(first.status_changes, 1);
    let rows = store.list_group_memberships(1).await.unwrap();
    let logs = store.list_group_logs(1).await.unwrap();

    let later = t0() + Duration::hours(6);
    let second = orchestrator.evaluate_all(&RunContext::at("cron", later)).await.unwrap();
    assert_eq!(second.status_changes, 0);
    assert_eq!(second.pairs_processed, 3);
    assert_eq!(store.list_group_memberships(1).await.unwrap(), rows);
    assert_eq!(store.list_group_logs(1).await.unwrap(), logs);
}

// ============================================================================
// Grace lifecycle
// ============================================================================

#[tokio::test]
async fn grace_period_runs_its_course() {
    let store = corp_group_store(grace_group(1, 3)).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    let orchestrator = engine(&store);

    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert!(store.permission_members(100).await.contains(&7));

    // Character leaves the corp.
    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;
    let t1 = t0() + Duration::hours(1);
    orchestrator.evaluate_all(&RunContext::at("cron", t1)).await.unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Grace);
    assert_eq!(m.grace_expires_at, Some(t1 + Duration::days(3)));
    assert_eq!(m.grace_filter_id, Some(10));
    assert!(!store.permission_members(100).await.contains(&7));

    // Still failing inside the window: deadline is not pushed back.
    let t2 = t1 + Duration::days(1);
    let report = orchestrator.evaluate_all(&RunContext::at("cron", t2)).await.unwrap();
    assert_eq!(report.status_changes, 0);
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.grace_expires_at, Some(t1 + Duration::days(3)));

    // Window elapsed.
    let t3 = t1 + Duration::days(3) + Duration::minutes(1);
    orchestrator.evaluate_all(&RunContext::at("cron", t3)).await.unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert_eq!(m.reason, "Grace period expired");
    assert_eq!(m.grace_expires_at, None);
    let expired = m;

    // Staying out does not start a fresh grace period, and the row is untouched.
    let t4 = t3 + Duration::days(1);
    let report = orchestrator.evaluate_all(&RunContext::at("cron", t4)).await.unwrap();
    assert_eq!(report.status_changes, 0);
    assert_eq!(store.get_membership(1, 7).await.unwrap().unwrap(), expired);

    let actions: Vec<LogAction> = store
        .list_group_logs(1)
        .await
        .unwrap()
        .iter()
        .map(|l| l.action)
        .collect();
    assert_eq!(actions, vec![LogAction::Add, LogAction::GraceStart, LogAction::Remove]);
    assert_eq!(store.list_user_notifications(7).await.unwrap().len(), 3);
}

#[tokio::test]
async fn recovering_during_grace_restores_membership() {
    let store = corp_group_store(grace_group(1, 3)).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    let orchestrator = engine(&store);
    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();

    store.clear_org_facts(70).await;
    orchestrator
        .evaluate_all(&RunContext::at("cron", t0() + Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(
        store.get_membership(1, 7).await.unwrap().unwrap().status,
        MembershipStatus::Grace
    );

    seed_character(&store, 7, 70, Some(CORP), None).await;
    orchestrator
        .evaluate_all(&RunContext::at("cron", t0() + Duration::hours(2)))
        .await
        .unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::In);
    assert_eq!(m.grace_expires_at, None);
    assert!(store.permission_members(100).await.contains(&7));
}

#[tokio::test]
async fn filter_grace_period_overrides_group_default() {
    let store = Arc::new(MemoryStore::new());
    store.seed_group(grace_group(1, 7)).await;
    let mut corp = filter(10, "alt_corp", json!({"corporation_id": CORP}));
    corp.grace_period_days = Some(1);
    store.seed_filter(corp).await;
    store.seed_chain(vec![entry(1, 10, 1)]).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    let orchestrator = engine(&store);
    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();

    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;
    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.grace_expires_at, Some(t0() + Duration::days(1)));
}

// ============================================================================
// Overrides
// ============================================================================

fn override_for(id: OverrideId, status: MembershipStatus, expires_in: Option<Duration>) -> MembershipOverride {
    MembershipOverride {
        override_id: id,
        group_id: 1,
        user_id: 7,
        forced_status: status,
        note: Some("leadership exception".into()),
        expires_at: expires_in.map(|d| t0() + d),
        created_by: Some("director".into()),
        created_at: t0() - Duration::days(2) + Duration::minutes(id),
    }
}

#[tokio::test]
async fn active_override_beats_failing_chain() {
    let store = corp_group_store(group(1)).await;
    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;
    store
        .seed_override(override_for(1, MembershipStatus::In, Some(Duration::days(5))))
        .await;

    let report = engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert_eq!(report.overrides_applied, 1);

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::In);
    assert_eq!(m.source, MembershipSource::Override);
    assert_eq!(m.reason, "Manual override applied");
    assert_eq!(m.override_id, Some(1));
    assert!(m.evidence.is_empty());
    assert!(store.permission_members(100).await.contains(&7));

    // The chain never ran for this pair.
    assert_eq!(store.load_chain(1).await.unwrap()[0].last_evaluated_at, None);
}

#[tokio::test]
async fn expired_override_falls_back_to_rules() {
    let store = corp_group_store(group(1)).await;
    seed_character(&store, 7, 70, Some(OTHER_CORP), None).await;
    store
        .seed_override(override_for(1, MembershipStatus::In, Some(-Duration::hours(1))))
        .await;

    let report = engine(&store).evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert_eq!(report.overrides_applied, 0);

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert_eq!(m.source, MembershipSource::Auto);
}

#[tokio::test]
async fn override_can_force_removal_of_eligible_user() {
    let store = corp_group_store(group(1)).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    let orchestrator = engine(&store);
    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();
    assert!(store.permission_members(100).await.contains(&7));

    store
        .seed_override(override_for(1, MembershipStatus::Out, None))
        .await;
    orchestrator.evaluate_all(&RunContext::at("cron", t0())).await.unwrap();

    let m = store.get_membership(1, 7).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::Out);
    assert_eq!(m.source, MembershipSource::Override);
    assert!(!store.permission_members(100).await.contains(&7));

    let logs = store.list_group_logs(1).await.unwrap();
    assert_eq!(logs.last().unwrap().action, LogAction::Remove);
    assert_eq!(logs.last().unwrap().source, MembershipSource::Override);
}

// ============================================================================
// Scopes
// ============================================================================

#[tokio::test]
async fn group_and_user_scopes_narrow_the_pairs() {
    let store = corp_group_store(group(1)).await;
    store.seed_group(group(2)).await;
    seed_character(&store, 7, 70, Some(CORP), None).await;
    seed_character(&store, 8, 80, Some(CORP), None).await;
    let orchestrator = engine(&store);
    let ctx = RunContext::at("cron", t0());

    let report = orchestrator.evaluate_group(1, &ctx).await.unwrap();
    assert_eq!(report.pairs_processed, 2);
    assert!(store.get_membership(2, 7).await.unwrap().is_none());

    let report = orchestrator.evaluate_user(8, &ctx).await.unwrap();
    assert_eq!(report.pairs_processed, 2);
    // Group 2 has no rules, so every user qualifies.
    let m = store.get_membership(2, 8).await.unwrap().unwrap();
    assert_eq!(m.status, MembershipStatus::In);
    assert_eq!(m.reason, "No enabled rules configured");
    assert!(store.get_membership(2, 7).await.unwrap().is_none());
}
