//! In-memory backend for every store port.
//!
//! Used by tests and by `secgroups_eval --fixture`. State lives behind
//! `tokio::sync::RwLock`s; a YAML fixture can seed configuration and facts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::*;
use crate::store::{
    ApplicationStore, FactSource, GroupCatalog, MembershipStore, OverrideStore, PermissionGroups,
};

/// Seed data for `MemoryStore`, typically loaded from YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub groups: Vec<SecureGroup>,
    pub filters: Vec<FilterRecord>,
    pub chain: Vec<ChainEntry>,
    /// Users known to the fact source even without characters
    pub users: Vec<UserId>,
    pub characters: Vec<CharacterRecord>,
    pub org_facts: Vec<CharacterOrgFacts>,
    /// permission group id -> member user ids
    pub permission_groups: BTreeMap<PermissionGroupId, Vec<UserId>>,
    pub overrides: Vec<MembershipOverride>,
    pub memberships: Vec<Membership>,
}

#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<BTreeMap<GroupId, SecureGroup>>,
    filters: RwLock<BTreeMap<FilterId, FilterRecord>>,
    chain: RwLock<Vec<ChainEntry>>,
    users: RwLock<BTreeSet<UserId>>,
    characters: RwLock<BTreeMap<CharacterId, CharacterRecord>>,
    org_facts: RwLock<HashMap<CharacterId, CharacterOrgFacts>>,
    permission_members: RwLock<BTreeMap<PermissionGroupId, BTreeSet<UserId>>>,
    overrides: RwLock<Vec<MembershipOverride>>,
    memberships: RwLock<BTreeMap<(GroupId, UserId), Membership>>,
    logs: RwLock<Vec<LogEntry>>,
    notifications: RwLock<Vec<Notification>>,
    applications: RwLock<BTreeMap<Uuid, MembershipApplication>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_fixture(fixture: Fixture) -> Self {
        let store = Self::new();
        for group in fixture.groups {
            store.seed_group(group).await;
        }
        for filter in fixture.filters {
            store.seed_filter(filter).await;
        }
        store.seed_chain(fixture.chain).await;
        for user_id in fixture.users {
            store.seed_user(user_id).await;
        }
        for character in fixture.characters {
            store.seed_character(character).await;
        }
        for facts in fixture.org_facts {
            store.seed_org_facts(facts).await;
        }
        for (pg, members) in fixture.permission_groups {
            for user_id in members {
                store.seed_permission_group_member(pg, user_id).await;
            }
        }
        for ov in fixture.overrides {
            store.seed_override(ov).await;
        }
        {
            let mut memberships = store.memberships.write().await;
            for m in fixture.memberships {
                memberships.insert((m.group_id, m.user_id), m);
            }
        }
        store
    }

    pub async fn from_fixture_yaml(yaml: &str) -> Result<Self> {
        let fixture: Fixture = serde_yaml::from_str(yaml).context("parse fixture YAML")?;
        Ok(Self::from_fixture(fixture).await)
    }

    pub async fn load_fixture(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read fixture {}", path.display()))?;
        Self::from_fixture_yaml(&yaml).await
    }

    // ── Seeding ──

    pub async fn seed_group(&self, group: SecureGroup) {
        self.groups.write().await.insert(group.group_id, group);
    }

    pub async fn seed_filter(&self, filter: FilterRecord) {
        self.filters.write().await.insert(filter.filter_id, filter);
    }

    /// Adds entries, replacing any existing entry for the same (group, filter).
    pub async fn seed_chain(&self, entries: Vec<ChainEntry>) {
        let mut chain = self.chain.write().await;
        for entry in entries {
            chain.retain(|e| !(e.group_id == entry.group_id && e.filter_id == entry.filter_id));
            chain.push(entry);
        }
    }

    pub async fn seed_user(&self, user_id: UserId) {
        self.users.write().await.insert(user_id);
    }

    pub async fn seed_character(&self, character: CharacterRecord) {
        self.users.write().await.insert(character.user_id);
        self.characters
            .write()
            .await
            .insert(character.character_id, character);
    }

    pub async fn seed_org_facts(&self, facts: CharacterOrgFacts) {
        self.org_facts.write().await.insert(facts.character_id, facts);
    }

    pub async fn seed_permission_group_member(&self, group_id: PermissionGroupId, user_id: UserId) {
        self.permission_members
            .write()
            .await
            .entry(group_id)
            .or_default()
            .insert(user_id);
    }

    pub async fn seed_override(&self, ov: MembershipOverride) {
        self.overrides.write().await.push(ov);
    }

    /// Drop a character's org facts, as when the audit pipeline loses track of it.
    pub async fn clear_org_facts(&self, character_id: CharacterId) {
        self.org_facts.write().await.remove(&character_id);
    }

    pub async fn permission_members(&self, group_id: PermissionGroupId) -> BTreeSet<UserId> {
        self.permission_members
            .read()
            .await
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }
}

// ── GroupCatalog ──

#[async_trait]
impl GroupCatalog for MemoryStore {
    async fn list_groups(&self) -> Result<Vec<SecureGroup>> {
        Ok(self.groups.read().await.values().cloned().collect())
    }

    async fn load_group(&self, group_id: GroupId) -> Result<Option<SecureGroup>> {
        Ok(self.groups.read().await.get(&group_id).cloned())
    }

    async fn load_filters(&self) -> Result<Vec<FilterRecord>> {
        Ok(self.filters.read().await.values().cloned().collect())
    }

    async fn load_chain(&self, group_id: GroupId) -> Result<Vec<ChainEntry>> {
        Ok(self
            .chain
            .read()
            .await
            .iter()
            .filter(|e| e.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn record_chain_result(&self, result: &ChainEntryResult) -> Result<()> {
        let mut chain = self.chain.write().await;
        if let Some(entry) = chain
            .iter_mut()
            .find(|e| e.group_id == result.group_id && e.filter_id == result.filter_id)
        {
            entry.last_evaluated_at = Some(result.evaluated_at);
            entry.last_pass = Some(result.pass);
            entry.last_message = Some(result.message.clone());
            entry.last_user_id = Some(result.user_id);
        }
        Ok(())
    }

    async fn touch_group(&self, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        if let Some(group) = self.groups.write().await.get_mut(&group_id) {
            group.last_update_at = Some(at);
        }
        Ok(())
    }
}

// ── FactSource ──

#[async_trait]
impl FactSource for MemoryStore {
    async fn list_users(&self) -> Result<Vec<UserId>> {
        Ok(self.users.read().await.iter().copied().collect())
    }

    async fn load_characters(&self, user_id: UserId) -> Result<Vec<CharacterRecord>> {
        Ok(self
            .characters
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn load_org_facts(&self, character_ids: &[CharacterId]) -> Result<Vec<CharacterOrgFacts>> {
        let facts = self.org_facts.read().await;
        Ok(character_ids
            .iter()
            .filter_map(|id| facts.get(id).copied())
            .collect())
    }
}

// ── PermissionGroups ──

#[async_trait]
impl PermissionGroups for MemoryStore {
    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<PermissionGroupId>> {
        Ok(self
            .permission_members
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn add_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        self.seed_permission_group_member(group_id, user_id).await;
        Ok(())
    }

    async fn remove_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        if let Some(members) = self.permission_members.write().await.get_mut(&group_id) {
            members.remove(&user_id);
        }
        Ok(())
    }
}

// ── MembershipStore ──

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get_membership(&self, group_id: GroupId, user_id: UserId) -> Result<Option<Membership>> {
        Ok(self.memberships.read().await.get(&(group_id, user_id)).cloned())
    }

    async fn upsert_membership(&self, membership: &Membership) -> Result<()> {
        self.memberships
            .write()
            .await
            .insert((membership.group_id, membership.user_id), membership.clone());
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn append_notification(&self, notification: &Notification) -> Result<()> {
        self.notifications.write().await.push(notification.clone());
        Ok(())
    }

    async fn list_group_memberships(&self, group_id: GroupId) -> Result<Vec<Membership>> {
        Ok(self
            .memberships
            .read()
            .await
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn list_user_memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        Ok(self
            .memberships
            .read()
            .await
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_group_logs(&self, group_id: GroupId) -> Result<Vec<LogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn latest_log(&self, group_id: GroupId, user_id: UserId) -> Result<Option<LogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .rev()
            .find(|l| l.group_id == group_id && l.user_id == user_id)
            .cloned())
    }

    async fn list_user_notifications(&self, user_id: UserId) -> Result<Vec<Notification>> {
        Ok(self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }
}

// ── OverrideStore ──

#[async_trait]
impl OverrideStore for MemoryStore {
    async fn overrides_for_pair(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Vec<MembershipOverride>> {
        Ok(self
            .overrides
            .read()
            .await
            .iter()
            .filter(|o| o.group_id == group_id && o.user_id == user_id)
            .cloned()
            .collect())
    }
}

// ── ApplicationStore ──

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn save_application(&self, application: &MembershipApplication) -> Result<()> {
        self.applications
            .write()
            .await
            .insert(application.application_id, application.clone());
        Ok(())
    }

    async fn load_application(&self, application_id: Uuid) -> Result<Option<MembershipApplication>> {
        Ok(self.applications.read().await.get(&application_id).cloned())
    }

    async fn pending_application(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Option<MembershipApplication>> {
        Ok(self
            .applications
            .read()
            .await
            .values()
            .find(|a| {
                a.group_id == group_id
                    && a.user_id == user_id
                    && a.status == ApplicationStatus::Pending
            })
            .cloned())
    }

    async fn list_applications(&self, group_id: GroupId) -> Result<Vec<MembershipApplication>> {
        let mut apps: Vec<_> = self
            .applications
            .read()
            .await
            .values()
            .filter(|a| a.group_id == group_id)
            .cloned()
            .collect();
        apps.sort_by_key(|a| a.created_at);
        Ok(apps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FIXTURE: &str = r#"
groups:
  - group_id: 1
    key: alts
    name: Alt Holders
    can_grace: true
    grace_default_days: 3
    permission_group_id: 50
filters:
  - filter_id: 10
    name: corp
    filter_type: alt_corp
    config: { corporation_id: 98000001 }
chain:
  - { group_id: 1, filter_id: 10, sort_order: 1 }
users: [3]
characters:
  - { character_id: 900, user_id: 2, name: Main, is_main: true }
org_facts:
  - { character_id: 900, corporation_id: 98000001, alliance_id: 99000001 }
permission_groups:
  50: [2]
"#;

    #[tokio::test]
    async fn fixture_seeds_everything() {
        let store = MemoryStore::from_fixture_yaml(FIXTURE).await.unwrap();
        assert_eq!(store.list_groups().await.unwrap().len(), 1);
        assert_eq!(store.load_filters().await.unwrap()[0].filter_id, 10);
        assert!(store.load_chain(1).await.unwrap()[0].enabled);
        assert_eq!(store.list_users().await.unwrap(), vec![2, 3]);
        assert_eq!(store.load_characters(2).await.unwrap().len(), 1);
        assert_eq!(
            store.load_org_facts(&[900, 901]).await.unwrap()[0].alliance_id,
            Some(99000001)
        );
        assert_eq!(store.groups_for_user(2).await.unwrap(), vec![50]);
    }

    #[tokio::test]
    async fn fixture_file_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FIXTURE.as_bytes()).unwrap();
        let store = MemoryStore::load_fixture(file.path()).await.unwrap();
        assert!(store.load_group(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bad_fixture_is_an_error() {
        assert!(MemoryStore::from_fixture_yaml("groups: 7").await.is_err());
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_pair() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut m = Membership {
            group_id: 1,
            user_id: 2,
            status: MembershipStatus::In,
            source: MembershipSource::Auto,
            reason: "ok".into(),
            evidence: Vec::new(),
            grace_expires_at: None,
            grace_filter_id: None,
            override_id: None,
            created_at: now,
            updated_at: now,
        };
        store.upsert_membership(&m).await.unwrap();
        m.status = MembershipStatus::Out;
        store.upsert_membership(&m).await.unwrap();

        let rows = store.list_group_memberships(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MembershipStatus::Out);
    }

    #[tokio::test]
    async fn permission_membership_is_idempotent() {
        let store = MemoryStore::new();
        store.add_member(5, 1).await.unwrap();
        store.add_member(5, 1).await.unwrap();
        store.remove_member(6, 1).await.unwrap();
        assert_eq!(store.permission_members(5).await.len(), 1);
        store.remove_member(5, 1).await.unwrap();
        store.remove_member(5, 1).await.unwrap();
        assert!(store.permission_members(5).await.is_empty());
    }
}
