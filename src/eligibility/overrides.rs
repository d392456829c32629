//! Manual override lookup
//!
//! An active override replaces rule evaluation for its pair entirely.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::api::{GroupId, MembershipOverride, MembershipStatus, UserId};
use crate::eligibility::EligibilityOutcome;
use crate::store::OverrideStore;

pub const REASON_OVERRIDE: &str = "Manual override applied";

pub struct OverrideResolver {
    store: Arc<dyn OverrideStore>,
}

impl OverrideResolver {
    pub fn new(store: Arc<dyn OverrideStore>) -> Self {
        Self { store }
    }

    /// The most recently created override that has not expired at `now`.
    pub async fn resolve(
        &self,
        group_id: GroupId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<MembershipOverride>> {
        let overrides = self
            .store
            .overrides_for_pair(group_id, user_id)
            .await
            .with_context(|| format!("load overrides for group {group_id} user {user_id}"))?;

        Ok(overrides
            .into_iter()
            .filter(|o| o.is_active_at(now))
            .max_by_key(|o| (o.created_at, o.override_id)))
    }

    /// Outcome forced by an override. A forced GRACE lasts until the
    /// override itself expires.
    pub fn outcome_for(&self, ov: &MembershipOverride) -> EligibilityOutcome {
        EligibilityOutcome {
            status: ov.forced_status,
            reason: REASON_OVERRIDE.to_string(),
            evidence: Vec::new(),
            grace_expires_at: match ov.forced_status {
                MembershipStatus::Grace => ov.expires_at,
                _ => None,
            },
            failed_filter_id: None,
        }
    }
}
