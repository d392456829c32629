//! Secure Group Repository: Postgres implementation of the store ports
//!
//! Runtime-checked queries against the `secure_groups` schema
//! (see `migrations/001_secure_groups.sql`).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::api::*;
use crate::store::{
    ApplicationStore, FactSource, GroupCatalog, MembershipStore, OverrideStore, PermissionGroups,
};

#[derive(Clone)]
pub struct PgSecureGroupStore {
    pool: PgPool,
}

impl PgSecureGroupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Private FromRow types, converted to public API types via Into / TryInto
// ============================================================================

#[derive(sqlx::FromRow)]
struct SecureGroupRow {
    group_id: i64,
    key: String,
    name: String,
    description: Option<String>,
    enabled: bool,
    allow_applications: bool,
    can_grace: bool,
    grace_default_days: i32,
    permission_group_id: Option<i64>,
    last_update_at: Option<DateTime<Utc>>,
}

impl From<SecureGroupRow> for SecureGroup {
    fn from(r: SecureGroupRow) -> Self {
        Self {
            group_id: r.group_id,
            key: r.key,
            name: r.name,
            description: r.description,
            enabled: r.enabled,
            allow_applications: r.allow_applications,
            can_grace: r.can_grace,
            grace_default_days: days(r.grace_default_days),
            permission_group_id: r.permission_group_id,
            last_update_at: r.last_update_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FilterRow {
    filter_id: i64,
    name: String,
    filter_type: String,
    config: serde_json::Value,
    grace_period_days: Option<i32>,
}

impl From<FilterRow> for FilterRecord {
    fn from(r: FilterRow) -> Self {
        Self {
            filter_id: r.filter_id,
            name: r.name,
            filter_type: r.filter_type,
            config: r.config,
            grace_period_days: r.grace_period_days.map(days),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChainEntryRow {
    group_id: i64,
    filter_id: i64,
    sort_order: i32,
    enabled: bool,
    last_evaluated_at: Option<DateTime<Utc>>,
    last_pass: Option<bool>,
    last_message: Option<String>,
    last_user_id: Option<i64>,
}

impl From<ChainEntryRow> for ChainEntry {
    fn from(r: ChainEntryRow) -> Self {
        Self {
            group_id: r.group_id,
            filter_id: r.filter_id,
            sort_order: r.sort_order,
            enabled: r.enabled,
            last_evaluated_at: r.last_evaluated_at,
            last_pass: r.last_pass,
            last_message: r.last_message,
            last_user_id: r.last_user_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    override_id: i64,
    group_id: i64,
    user_id: i64,
    forced_status: String,
    note: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OverrideRow> for MembershipOverride {
    type Error = anyhow::Error;

    fn try_from(r: OverrideRow) -> Result<Self> {
        Ok(Self {
            override_id: r.override_id,
            group_id: r.group_id,
            user_id: r.user_id,
            forced_status: status(&r.forced_status)?,
            note: r.note,
            expires_at: r.expires_at,
            created_by: r.created_by,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CharacterRow {
    character_id: i64,
    user_id: i64,
    name: String,
    is_main: bool,
}

impl From<CharacterRow> for CharacterRecord {
    fn from(r: CharacterRow) -> Self {
        Self {
            character_id: r.character_id,
            user_id: r.user_id,
            name: r.name,
            is_main: r.is_main,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OrgFactsRow {
    character_id: i64,
    corporation_id: i64,
    alliance_id: Option<i64>,
}

impl From<OrgFactsRow> for CharacterOrgFacts {
    fn from(r: OrgFactsRow) -> Self {
        Self {
            character_id: r.character_id,
            corporation_id: r.corporation_id,
            alliance_id: r.alliance_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    group_id: i64,
    user_id: i64,
    status: String,
    source: String,
    reason: String,
    evidence: Json<Vec<Evidence>>,
    grace_expires_at: Option<DateTime<Utc>>,
    grace_filter_id: Option<i64>,
    override_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = anyhow::Error;

    fn try_from(r: MembershipRow) -> Result<Self> {
        Ok(Self {
            group_id: r.group_id,
            user_id: r.user_id,
            status: status(&r.status)?,
            source: source(&r.source)?,
            reason: r.reason,
            evidence: r.evidence.0,
            grace_expires_at: r.grace_expires_at,
            grace_filter_id: r.grace_filter_id,
            override_id: r.override_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    log_id: Uuid,
    group_id: i64,
    user_id: i64,
    action: String,
    status: String,
    source: String,
    reason: String,
    actor: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = anyhow::Error;

    fn try_from(r: LogRow) -> Result<Self> {
        Ok(Self {
            log_id: r.log_id,
            group_id: r.group_id,
            user_id: r.user_id,
            action: LogAction::from_str_val(&r.action)
                .ok_or_else(|| anyhow!("unknown log action {:?}", r.action))?,
            status: status(&r.status)?,
            source: source(&r.source)?,
            reason: r.reason,
            actor: r.actor,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    notification_id: Uuid,
    user_id: i64,
    group_id: i64,
    title: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(r: NotificationRow) -> Self {
        Self {
            notification_id: r.notification_id,
            user_id: r.user_id,
            group_id: r.group_id,
            title: r.title,
            message: r.message,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    application_id: Uuid,
    group_id: i64,
    user_id: i64,
    status: String,
    note: Option<String>,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    decided_by: Option<String>,
}

impl TryFrom<ApplicationRow> for MembershipApplication {
    type Error = anyhow::Error;

    fn try_from(r: ApplicationRow) -> Result<Self> {
        Ok(Self {
            application_id: r.application_id,
            group_id: r.group_id,
            user_id: r.user_id,
            status: ApplicationStatus::from_str_val(&r.status)
                .ok_or_else(|| anyhow!("unknown application status {:?}", r.status))?,
            note: r.note,
            created_at: r.created_at,
            decided_at: r.decided_at,
            decided_by: r.decided_by,
        })
    }
}

fn days(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn status(s: &str) -> Result<MembershipStatus> {
    MembershipStatus::from_str_val(s).ok_or_else(|| anyhow!("unknown membership status {s:?}"))
}

fn source(s: &str) -> Result<MembershipSource> {
    MembershipSource::from_str_val(s).ok_or_else(|| anyhow!("unknown membership source {s:?}"))
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// GroupCatalog
// ============================================================================

#[async_trait]
impl GroupCatalog for PgSecureGroupStore {
    async fn list_groups(&self) -> Result<Vec<SecureGroup>> {
        let rows = sqlx::query_as::<_, SecureGroupRow>(
            r#"SELECT * FROM secure_groups.secure_group ORDER BY group_id"#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list secure groups")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn load_group(&self, group_id: GroupId) -> Result<Option<SecureGroup>> {
        let row = sqlx::query_as::<_, SecureGroupRow>(
            r#"SELECT * FROM secure_groups.secure_group WHERE group_id = $1"#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch secure group")?;

        Ok(row.map(Into::into))
    }

    async fn load_filters(&self) -> Result<Vec<FilterRecord>> {
        let rows = sqlx::query_as::<_, FilterRow>(
            r#"SELECT * FROM secure_groups.group_filter ORDER BY filter_id"#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load filters")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn load_chain(&self, group_id: GroupId) -> Result<Vec<ChainEntry>> {
        let rows = sqlx::query_as::<_, ChainEntryRow>(
            r#"
            SELECT * FROM secure_groups.group_chain_entry
            WHERE group_id = $1
            ORDER BY sort_order, filter_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load rule chain")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_chain_result(&self, result: &ChainEntryResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE secure_groups.group_chain_entry
            SET last_evaluated_at = $3, last_pass = $4, last_message = $5, last_user_id = $6
            WHERE group_id = $1 AND filter_id = $2
            "#,
        )
        .bind(result.group_id)
        .bind(result.filter_id)
        .bind(result.evaluated_at)
        .bind(result.pass)
        .bind(&result.message)
        .bind(result.user_id)
        .execute(&self.pool)
        .await
        .context("Failed to record chain result")?;

        Ok(())
    }

    async fn touch_group(&self, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE secure_groups.secure_group SET last_update_at = $2 WHERE group_id = $1"#)
            .bind(group_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to touch secure group")?;

        Ok(())
    }
}

// ============================================================================
// FactSource
// ============================================================================

#[async_trait]
impl FactSource for PgSecureGroupStore {
    async fn list_users(&self) -> Result<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT user_id FROM secure_groups.character
            UNION
            SELECT user_id FROM secure_groups.permission_group_member
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        Ok(ids)
    }

    async fn load_characters(&self, user_id: UserId) -> Result<Vec<CharacterRecord>> {
        let rows = sqlx::query_as::<_, CharacterRow>(
            r#"SELECT * FROM secure_groups.character WHERE user_id = $1 ORDER BY character_id"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load characters")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn load_org_facts(&self, character_ids: &[CharacterId]) -> Result<Vec<CharacterOrgFacts>> {
        if character_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, OrgFactsRow>(
            r#"SELECT * FROM secure_groups.character_org_facts WHERE character_id = ANY($1)"#,
        )
        .bind(character_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load character org facts")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// PermissionGroups
// ============================================================================

#[async_trait]
impl PermissionGroups for PgSecureGroupStore {
    async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<PermissionGroupId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT permission_group_id FROM secure_groups.permission_group_member
            WHERE user_id = $1
            ORDER BY permission_group_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load permission groups")?;

        Ok(ids)
    }

    async fn add_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_groups.permission_group_member (permission_group_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to add permission group member")?;

        Ok(())
    }

    async fn remove_member(&self, group_id: PermissionGroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            r#"DELETE FROM secure_groups.permission_group_member WHERE permission_group_id = $1 AND user_id = $2"#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to remove permission group member")?;

        Ok(())
    }
}

// ============================================================================
// MembershipStore
// ============================================================================

#[async_trait]
impl MembershipStore for PgSecureGroupStore {
    async fn get_membership(&self, group_id: GroupId, user_id: UserId) -> Result<Option<Membership>> {
        let row = sqlx::query_as::<_, MembershipRow>(
            r#"SELECT * FROM secure_groups.membership WHERE group_id = $1 AND user_id = $2"#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch membership")?;

        row.map(Membership::try_from).transpose()
    }

    async fn upsert_membership(&self, m: &Membership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_groups.membership
                (group_id, user_id, status, source, reason, evidence,
                 grace_expires_at, grace_filter_id, override_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (group_id, user_id) DO UPDATE SET
                status = EXCLUDED.status,
                source = EXCLUDED.source,
                reason = EXCLUDED.reason,
                evidence = EXCLUDED.evidence,
                grace_expires_at = EXCLUDED.grace_expires_at,
                grace_filter_id = EXCLUDED.grace_filter_id,
                override_id = EXCLUDED.override_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(m.group_id)
        .bind(m.user_id)
        .bind(m.status.as_str())
        .bind(m.source.as_str())
        .bind(&m.reason)
        .bind(Json(&m.evidence))
        .bind(m.grace_expires_at)
        .bind(m.grace_filter_id)
        .bind(m.override_id)
        .bind(m.created_at)
        .bind(m.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert membership")?;

        Ok(())
    }

    async fn append_log(&self, e: &LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_groups.membership_log
                (log_id, group_id, user_id, action, status, source, reason, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(e.log_id)
        .bind(e.group_id)
        .bind(e.user_id)
        .bind(e.action.as_str())
        .bind(e.status.as_str())
        .bind(e.source.as_str())
        .bind(&e.reason)
        .bind(&e.actor)
        .bind(e.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to append membership log")?;

        Ok(())
    }

    async fn append_notification(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_groups.notification
                (notification_id, user_id, group_id, title, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(n.notification_id)
        .bind(n.user_id)
        .bind(n.group_id)
        .bind(&n.title)
        .bind(&n.message)
        .bind(n.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to append notification")?;

        Ok(())
    }

    async fn list_group_memberships(&self, group_id: GroupId) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"SELECT * FROM secure_groups.membership WHERE group_id = $1 ORDER BY user_id"#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list group memberships")?;

        convert_all(rows)
    }

    async fn list_user_memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"SELECT * FROM secure_groups.membership WHERE user_id = $1 ORDER BY group_id"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user memberships")?;

        convert_all(rows)
    }

    async fn list_group_logs(&self, group_id: GroupId) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"SELECT * FROM secure_groups.membership_log WHERE group_id = $1 ORDER BY created_at"#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list membership logs")?;

        convert_all(rows)
    }

    async fn latest_log(&self, group_id: GroupId, user_id: UserId) -> Result<Option<LogEntry>> {
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT * FROM secure_groups.membership_log
            WHERE group_id = $1 AND user_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest membership log")?;

        row.map(LogEntry::try_from).transpose()
    }

    async fn list_user_notifications(&self, user_id: UserId) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"SELECT * FROM secure_groups.notification WHERE user_id = $1 ORDER BY created_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list notifications")?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// OverrideStore
// ============================================================================

#[async_trait]
impl OverrideStore for PgSecureGroupStore {
    async fn overrides_for_pair(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Vec<MembershipOverride>> {
        let rows = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT * FROM secure_groups.group_override
            WHERE group_id = $1 AND user_id = $2
            ORDER BY created_at DESC, override_id DESC
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load overrides")?;

        convert_all(rows)
    }
}

// ============================================================================
// ApplicationStore
// ============================================================================

#[async_trait]
impl ApplicationStore for PgSecureGroupStore {
    async fn save_application(&self, a: &MembershipApplication) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secure_groups.membership_application
                (application_id, group_id, user_id, status, note, created_at, decided_at, decided_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (application_id) DO UPDATE SET
                status = EXCLUDED.status,
                note = EXCLUDED.note,
                decided_at = EXCLUDED.decided_at,
                decided_by = EXCLUDED.decided_by
            "#,
        )
        .bind(a.application_id)
        .bind(a.group_id)
        .bind(a.user_id)
        .bind(a.status.as_str())
        .bind(&a.note)
        .bind(a.created_at)
        .bind(a.decided_at)
        .bind(&a.decided_by)
        .execute(&self.pool)
        .await
        .context("Failed to save application")?;

        Ok(())
    }

    async fn load_application(&self, application_id: Uuid) -> Result<Option<MembershipApplication>> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            r#"SELECT * FROM secure_groups.membership_application WHERE application_id = $1"#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch application")?;

        row.map(MembershipApplication::try_from).transpose()
    }

    async fn pending_application(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Option<MembershipApplication>> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT * FROM secure_groups.membership_application
            WHERE group_id = $1 AND user_id = $2 AND status = 'pending'
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pending application")?;

        row.map(MembershipApplication::try_from).transpose()
    }

    async fn list_applications(&self, group_id: GroupId) -> Result<Vec<MembershipApplication>> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT * FROM secure_groups.membership_application
            WHERE group_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list applications")?;

        convert_all(rows)
    }
}
