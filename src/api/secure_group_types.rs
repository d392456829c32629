//! Secure Group Types
//!
//! Type definitions for the secure group eligibility engine. Covers the
//! administrator-owned configuration (groups, filters, rule chains, overrides),
//! the externally collected facts the engine reads (characters and their
//! corporation/alliance), and the records the engine writes (memberships,
//! log entries, notifications, applications).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub type GroupId = i64;
pub type FilterId = i64;
pub type UserId = i64;
pub type CharacterId = i64;
pub type CorporationId = i64;
pub type AllianceId = i64;
pub type PermissionGroupId = i64;
pub type OverrideId = i64;

// ============================================================================
// Configuration Types (administrator-owned, read-only to the engine)
// ============================================================================

/// A named membership target bound to a downstream permission group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureGroup {
    pub group_id: GroupId,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allow_applications: bool,
    #[serde(default)]
    pub can_grace: bool,
    #[serde(default)]
    pub grace_default_days: u32,
    #[serde(default)]
    pub permission_group_id: Option<PermissionGroupId>,
    #[serde(default)]
    pub last_update_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// Filter row as stored: a type tag plus a loosely-typed config blob.
/// Parsed into `eligibility::filters::Filter` once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub filter_id: FilterId,
    pub name: String,
    pub filter_type: String,
    #[serde(default)]
    pub config: JsonValue,
    #[serde(default)]
    pub grace_period_days: Option<u32>,
}

/// Binds a filter to a group at a position in the group's rule chain.
///
/// The `last_*` fields cache the most recent per-user result of this filter.
/// They are an observability artifact only; the engine never reads them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub group_id: GroupId,
    pub filter_id: FilterId,
    pub sort_order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_evaluated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_pass: Option<bool>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_user_id: Option<UserId>,
}

/// One filter's result for one user, written onto its chain entry
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntryResult {
    pub group_id: GroupId,
    pub filter_id: FilterId,
    pub user_id: UserId,
    pub pass: bool,
    pub message: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Manual, optionally time-bounded forced status for a (group, user) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipOverride {
    pub override_id: OverrideId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub forced_status: MembershipStatus,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MembershipOverride {
    /// An override without an expiry never lapses.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

// ============================================================================
// Fact Types (populated by the external audit pipeline)
// ============================================================================

/// A character owned by a user. Exactly one character per user is the main.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub character_id: CharacterId,
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_main: bool,
}

/// Last known organisational placement of a character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterOrgFacts {
    pub character_id: CharacterId,
    pub corporation_id: CorporationId,
    #[serde(default)]
    pub alliance_id: Option<AllianceId>,
}

/// One character inside a `UserFacts` snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterFacts {
    pub character_id: CharacterId,
    pub is_main: bool,
    pub org: Option<CharacterOrgFacts>,
}

/// Point-in-time snapshot of everything the filter evaluator may read for a user
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserFacts {
    pub user_id: UserId,
    pub characters: Vec<CharacterFacts>,
    pub permission_groups: BTreeSet<PermissionGroupId>,
}

impl UserFacts {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    /// True when at least one character has corp/alliance facts on record
    pub fn has_org_facts(&self) -> bool {
        self.characters.iter().any(|c| c.org.is_some())
    }
}

// ============================================================================
// Evaluation Records (written by the engine)
// ============================================================================

/// Structured trace of one filter evaluation. Expressions nest their
/// operands under `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub filter_id: FilterId,
    pub filter_type: String,
    pub pass: bool,
    pub message: String,
    #[serde(default)]
    pub negated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Evidence>,
}

/// Authoritative eligibility record for a (group, user) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub status: MembershipStatus,
    pub source: MembershipSource,
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub grace_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grace_filter_id: Option<FilterId>,
    #[serde(default)]
    pub override_id: Option<OverrideId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of a membership status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: Uuid,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub action: LogAction,
    pub status: MembershipStatus,
    pub source: MembershipSource,
    pub reason: String,
    #[serde(default)]
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// User-facing message written alongside each LogEntry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: Uuid,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A user's request to join a group that accepts applications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipApplication {
    pub application_id: Uuid,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub status: ApplicationStatus,
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

// ============================================================================
// Domain Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    In,
    Out,
    Grace,
}

impl MembershipStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Self::In),
            "OUT" => Some(Self::Out),
            "GRACE" => Some(Self::Grace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Grace => "GRACE",
        }
    }
}

/// Which path produced a membership decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipSource {
    Auto,
    Override,
    Request,
}

impl MembershipSource {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "AUTO" => Some(Self::Auto),
            "OVERRIDE" => Some(Self::Override),
            "REQUEST" => Some(Self::Request),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Override => "OVERRIDE",
            Self::Request => "REQUEST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    Add,
    Remove,
    GraceStart,
    RequestApprove,
    RequestDeny,
}

impl LogAction {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(Self::Add),
            "REMOVE" => Some(Self::Remove),
            "GRACE_START" => Some(Self::GraceStart),
            "REQUEST_APPROVE" => Some(Self::RequestApprove),
            "REQUEST_DENY" => Some(Self::RequestDeny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
            Self::GraceStart => "GRACE_START",
            Self::RequestApprove => "REQUEST_APPROVE",
            Self::RequestDeny => "REQUEST_DENY",
        }
    }

    /// Action recorded when a pair moves into `status` via `source`
    pub fn for_transition(status: MembershipStatus, source: MembershipSource) -> Self {
        match (status, source) {
            (MembershipStatus::In, MembershipSource::Request) => Self::RequestApprove,
            (MembershipStatus::In, _) => Self::Add,
            (MembershipStatus::Grace, _) => Self::GraceStart,
            (MembershipStatus::Out, _) => Self::Remove,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Denied,
}

impl ApplicationStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}
