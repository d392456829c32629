//! Shared builders for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use secure_groups::api::*;
use secure_groups::store::{MembershipStore, PermissionGroups};
use secure_groups::store_memory::MemoryStore;

pub const CORP: i64 = 98000001;
pub const OTHER_CORP: i64 = 98000002;
pub const ALLIANCE: i64 = 99000001;

pub fn group(group_id: GroupId) -> SecureGroup {
    SecureGroup {
        group_id,
        key: format!("group-{group_id}"),
        name: format!("Group {group_id}"),
        description: None,
        enabled: true,
        allow_applications: false,
        can_grace: false,
        grace_default_days: 0,
        permission_group_id: Some(group_id * 100),
        last_update_at: None,
    }
}

pub fn grace_group(group_id: GroupId, days: u32) -> SecureGroup {
    SecureGroup {
        can_grace: true,
        grace_default_days: days,
        ..group(group_id)
    }
}

pub fn filter(filter_id: FilterId, filter_type: &str, config: Value) -> FilterRecord {
    FilterRecord {
        filter_id,
        name: format!("{filter_type}-{filter_id}"),
        filter_type: filter_type.to_string(),
        config,
        grace_period_days: None,
    }
}

pub fn entry(group_id: GroupId, filter_id: FilterId, sort_order: i32) -> ChainEntry {
    ChainEntry {
        group_id,
        filter_id,
        sort_order,
        enabled: true,
        last_evaluated_at: None,
        last_pass: None,
        last_message: None,
        last_user_id: None,
    }
}

/// Seed one character for `user_id`, with corp/alliance facts when given.
pub async fn seed_character(
    store: &MemoryStore,
    user_id: UserId,
    character_id: CharacterId,
    corp: Option<CorporationId>,
    alliance: Option<AllianceId>,
) {
    store
        .seed_character(CharacterRecord {
            character_id,
            user_id,
            name: format!("char-{character_id}"),
            is_main: character_id % 10 == 0,
        })
        .await;
    if let Some(corporation_id) = corp {
        store
            .seed_org_facts(CharacterOrgFacts {
                character_id,
                corporation_id,
                alliance_id: alliance,
            })
            .await;
    }
}

/// Consume one failure from `remaining`, if any are left.
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Memberships wrapper whose writes fail for one user a set number of times.
pub struct FailingMemberships {
    inner: Arc<MemoryStore>,
    fail_user: UserId,
    upsert_failures: AtomicUsize,
    log_failures: AtomicUsize,
}

impl FailingMemberships {
    pub fn new(inner: Arc<MemoryStore>, fail_user: UserId) -> Self {
        Self {
            inner,
            fail_user,
            upsert_failures: AtomicUsize::new(0),
            log_failures: AtomicUsize::new(0),
        }
    }

    /// Every upsert for the user fails.
    pub fn always(inner: Arc<MemoryStore>, fail_user: UserId) -> Self {
        Self::new(inner, fail_user).failing_upserts(usize::MAX)
    }

    pub fn failing_upserts(self, times: usize) -> Self {
        self.upsert_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_logs(self, times: usize) -> Self {
        self.log_failures.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MembershipStore for FailingMemberships {
    async fn get_membership(&self, group_id: GroupId, user_id: UserId) -> Result<Option<Membership>> {
        self.inner.get_membership(group_id, user_id).await
    }

    async fn upsert_membership(&self, membership: &Membership) -> Result<()> {
        if membership.user_id == self.fail_user && take_failure(&self.upsert_failures) {
            bail!("connection reset while writing membership");
        }
        self.inner.upsert_membership(membership).await
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        if entry.user_id == self.fail_user && take_failure(&self.log_failures) {
            bail!("connection reset while writing log");
        }
        self.inner.append_log(entry).await
    }

    async fn append_notification(&self, notification: &Notification) -> Result<()> {
        self.inner.append_notification(notification).await
    }

    async fn list_group_memberships(&self, group_id: GroupId) -> Result<Vec<Membership>> {
        self.inner.list_group_memberships(group_id).await
    }

    async fn list_user_memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        self.inner.list_user_memberships(user_id).await
    }

    async fn list_group_logs(&self, group_id: GroupId) -> Result<Vec<LogEntry>> {
        self.inner.list_group_logs(group_id).await
    }

    async fn latest_log(&self, group_id: GroupId, user_id: UserId) -> Result<Option<LogEntry>> {
        self.inner.latest_log(group_id, user_id).await
    }

    async fn list_user_notifications(&self, user_id: UserId) -> Result<Vec<Notification>> {
        self.inner.list_user_notifications(user_id).await
    }
}

/// Permission groups whose `add_member` fails a set number of times.
pub struct FlakyPermissions {
    pub inner: Arc<MemoryStore>,
    pub add_failures: AtomicUsize,
}

impl FlakyPermissions {
    pub fn failing_adds(inner: Arc<MemoryStore>, times: usize) -> Self {
        Self {
            inner,
            add_failures: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl PermissionGroups for FlakyPermissions {
    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<PermissionGroupId>> {
        self.inner.groups_for_user(user_id).await
    }

    async fn add_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        if take_failure(&self.add_failures) {
            bail!("permission service unavailable");
        }
        self.inner.add_member(group_id, user_id).await
    }

    async fn remove_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        self.inner.remove_member(group_id, user_id).await
    }
}
