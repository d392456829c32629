//! Persistence ports for the eligibility engine.
//!
//! The engine operates exclusively through these traits, enabling pluggable
//! backends (`MemoryStore` for fixtures and tests, Postgres for production).
//! Split by owner: configuration is written by administrators, facts by the
//! audit pipeline, memberships and their history by the engine itself.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::*;

// ── Group configuration ──

#[async_trait]
pub trait GroupCatalog: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<SecureGroup>>;
    async fn load_group(&self, group_id: GroupId) -> Result<Option<SecureGroup>>;
    async fn load_filters(&self) -> Result<Vec<FilterRecord>>;
    async fn load_chain(&self, group_id: GroupId) -> Result<Vec<ChainEntry>>;

    /// Overwrite the observability cache on one chain entry.
    async fn record_chain_result(&self, result: &ChainEntryResult) -> Result<()>;
    async fn touch_group(&self, group_id: GroupId, at: DateTime<Utc>) -> Result<()>;
}

// ── Collected facts ──

#[async_trait]
pub trait FactSource: Send + Sync {
    async fn list_users(&self) -> Result<Vec<UserId>>;
    async fn load_characters(&self, user_id: UserId) -> Result<Vec<CharacterRecord>>;
    async fn load_org_facts(&self, character_ids: &[CharacterId])
        -> Result<Vec<CharacterOrgFacts>>;
}

// ── Downstream permission groups ──

#[async_trait]
pub trait PermissionGroups: Send + Sync {
    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<PermissionGroupId>>;

    /// Idempotent: adding an existing member is a no-op.
    async fn add_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()>;

    /// Idempotent: removing a non-member is a no-op.
    async fn remove_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()>;
}

// ── Memberships and their history ──

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_membership(&self, group_id: GroupId, user_id: UserId)
        -> Result<Option<Membership>>;

    /// Insert or update in place. At most one row per (group, user).
    async fn upsert_membership(&self, membership: &Membership) -> Result<()>;

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;
    async fn append_notification(&self, notification: &Notification) -> Result<()>;

    async fn list_group_memberships(&self, group_id: GroupId) -> Result<Vec<Membership>>;
    async fn list_user_memberships(&self, user_id: UserId) -> Result<Vec<Membership>>;
    async fn list_group_logs(&self, group_id: GroupId) -> Result<Vec<LogEntry>>;
    /// Most recent log entry for the pair, if any.
    async fn latest_log(&self, group_id: GroupId, user_id: UserId) -> Result<Option<LogEntry>>;
    async fn list_user_notifications(&self, user_id: UserId) -> Result<Vec<Notification>>;
}

// ── Overrides ──

#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// Every override recorded for the pair, expired or not.
    async fn overrides_for_pair(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Vec<MembershipOverride>>;
}

// ── Applications ──

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn save_application(&self, application: &MembershipApplication) -> Result<()>;
    async fn load_application(&self, application_id: Uuid)
        -> Result<Option<MembershipApplication>>;
    async fn pending_application(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Option<MembershipApplication>>;
    async fn list_applications(&self, group_id: GroupId) -> Result<Vec<MembershipApplication>>;
}

/// One handle per port, shared by every engine component.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn GroupCatalog>,
    pub facts: Arc<dyn FactSource>,
    pub permissions: Arc<dyn PermissionGroups>,
    pub memberships: Arc<dyn MembershipStore>,
    pub overrides: Arc<dyn OverrideStore>,
    pub applications: Arc<dyn ApplicationStore>,
}

impl Stores {
    /// Wire every port to the same backend.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: GroupCatalog
            + FactSource
            + PermissionGroups
            + MembershipStore
            + OverrideStore
            + ApplicationStore
            + 'static,
    {
        Self {
            catalog: backend.clone(),
            facts: backend.clone(),
            permissions: backend.clone(),
            memberships: backend.clone(),
            overrides: backend.clone(),
            applications: backend,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionGroups>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_memberships(mut self, memberships: Arc<dyn MembershipStore>) -> Self {
        self.memberships = memberships;
        self
    }
}
