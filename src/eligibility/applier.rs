//! Membership applier
//!
//! Records an outcome for a (group, user) pair and performs its side effects:
//!
//! 1. Normalise grace against the *stored* membership (keep an existing
//!    deadline, demote an elapsed one to OUT).
//! 2. Sync the downstream permission group (unconditional, idempotent).
//! 3. Only if the status changed: append a LogEntry and a Notification and
//!    touch the group.
//! 4. Upsert the membership row.
//!
//! A failure in steps 2 or 3 leaves the stored row untouched, so the
//! transition is detected again on the next run. If its log entry already
//! landed, it is not written twice.
//!
//! Re-applying an unchanged outcome leaves the row as it was and writes no
//! history.

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{
    GroupId, LogAction, LogEntry, Membership, MembershipSource, MembershipStatus, Notification,
    OverrideId, SecureGroup, UserId,
};
use crate::config::EngineConfig;
use crate::eligibility::{EligibilityOutcome, RunContext};
use crate::error::Result;
use crate::store::Stores;

pub const REASON_GRACE_EXPIRED: &str = "Grace period expired";

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// Stored status before this apply; `None` for a first evaluation
    pub previous: Option<MembershipStatus>,
    pub membership: Membership,
    pub changed: bool,
}

pub struct MembershipApplier {
    stores: Stores,
    grace_keeps_access: bool,
}

impl MembershipApplier {
    pub fn new(stores: Stores, config: &EngineConfig) -> Self {
        Self {
            stores,
            grace_keeps_access: config.grace_keeps_access,
        }
    }

    pub async fn apply(
        &self,
        group: &SecureGroup,
        user_id: UserId,
        outcome: EligibilityOutcome,
        source: MembershipSource,
        override_id: Option<OverrideId>,
        ctx: &RunContext,
    ) -> Result<ApplyReport> {
        let memberships = &self.stores.memberships;

        let previous = memberships
            .get_membership(group.group_id, user_id)
            .await
            .context("load membership")?;

        let next = build_membership(previous.as_ref(), group, user_id, outcome, source, override_id, ctx.now);

        let previous_status = previous.as_ref().map(|m| m.status);
        // A pair never evaluated before counts as OUT, so first runs only log joins.
        let changed = previous_status.unwrap_or(MembershipStatus::Out) != next.status;

        self.sync_permission_group(group, user_id, next.status)
            .await?;

        if changed && !self.already_logged(group.group_id, user_id, next.status).await? {
            let action = LogAction::for_transition(next.status, source);
            self.record_transition(group, &next, action, ctx).await?;
        }

        // Written last so a failed sync or log write is retried on the next run.
        memberships
            .upsert_membership(&next)
            .await
            .context("upsert membership")?;

        debug!(
            group_id = group.group_id,
            user_id,
            status = next.status.as_str(),
            changed,
            "Applied membership"
        );

        Ok(ApplyReport {
            previous: previous_status,
            membership: next,
            changed,
        })
    }

    /// True when an earlier apply logged this status but failed before the
    /// membership row was written. Keeps the log to one entry per transition.
    async fn already_logged(
        &self,
        group_id: GroupId,
        user_id: UserId,
        status: MembershipStatus,
    ) -> Result<bool> {
        let latest = self
            .stores
            .memberships
            .latest_log(group_id, user_id)
            .await
            .context("load latest membership log")?;
        Ok(latest.is_some_and(|l| l.status == status))
    }

    async fn sync_permission_group(
        &self,
        group: &SecureGroup,
        user_id: UserId,
        status: MembershipStatus,
    ) -> Result<()> {
        let Some(permission_group_id) = group.permission_group_id else {
            return Ok(());
        };
        let keep = match status {
            MembershipStatus::In => true,
            MembershipStatus::Grace => self.grace_keeps_access,
            MembershipStatus::Out => false,
        };
        let permissions = &self.stores.permissions;
        if keep {
            permissions
                .add_member(permission_group_id, user_id)
                .await
                .context("add permission group member")?;
        } else {
            permissions
                .remove_member(permission_group_id, user_id)
                .await
                .context("remove permission group member")?;
        }
        Ok(())
    }

    /// Append the LogEntry/Notification pair for a transition and touch the group.
    pub(crate) async fn record_transition(
        &self,
        group: &SecureGroup,
        membership: &Membership,
        action: LogAction,
        ctx: &RunContext,
    ) -> Result<()> {
        self.record_event(
            group,
            membership.user_id,
            action,
            membership.status,
            membership.source,
            &membership.reason,
            membership.grace_expires_at,
            ctx,
        )
        .await?;

        if let Err(e) = self.stores.catalog.touch_group(group.group_id, ctx.now).await {
            warn!(group_id = group.group_id, "Failed to touch group: {e:#}");
        }
        Ok(())
    }

    /// Append a LogEntry and its Notification without touching the membership.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn record_event(
        &self,
        group: &SecureGroup,
        user_id: UserId,
        action: LogAction,
        status: MembershipStatus,
        source: MembershipSource,
        reason: &str,
        grace_expires_at: Option<DateTime<Utc>>,
        ctx: &RunContext,
    ) -> Result<()> {
        let entry = LogEntry {
            log_id: Uuid::new_v4(),
            group_id: group.group_id,
            user_id,
            action,
            status,
            source,
            reason: reason.to_string(),
            actor: Some(ctx.actor.clone()),
            created_at: ctx.now,
        };
        // Notification first: a stored log entry implies its notification exists.
        let memberships = &self.stores.memberships;
        memberships
            .append_notification(&notification_for(
                group,
                user_id,
                action,
                reason,
                grace_expires_at,
                ctx.now,
            ))
            .await
            .context("append notification")?;
        memberships
            .append_log(&entry)
            .await
            .context("append membership log")?;
        Ok(())
    }
}

/// Merge an outcome with the stored row into the row to write.
fn build_membership(
    previous: Option<&Membership>,
    group: &SecureGroup,
    user_id: UserId,
    outcome: EligibilityOutcome,
    source: MembershipSource,
    override_id: Option<OverrideId>,
    now: DateTime<Utc>,
) -> Membership {
    let EligibilityOutcome {
        mut status,
        mut reason,
        evidence,
        mut grace_expires_at,
        failed_filter_id,
    } = outcome;
    let mut grace_filter_id = None;

    if status == MembershipStatus::Grace {
        match previous {
            // Keep the running deadline; re-deriving it each run would never let it lapse.
            Some(p)
                if source == MembershipSource::Auto
                    && p.status == MembershipStatus::Grace
                    && p.grace_expires_at.is_some() =>
            {
                grace_expires_at = p.grace_expires_at;
                grace_filter_id = p.grace_filter_id.or(failed_filter_id);
            }
            Some(p) if matches!(p.status, MembershipStatus::In | MembershipStatus::Grace) => {
                grace_filter_id = failed_filter_id
            }
            _ if source != MembershipSource::Auto => grace_filter_id = failed_filter_id,
            // Grace only softens losing a membership; users who never had one go straight OUT.
            _ => {
                status = MembershipStatus::Out;
                grace_expires_at = None;
            }
        }

        if status == MembershipStatus::Grace {
            match grace_expires_at {
                Some(expires) if expires <= now => {
                    status = MembershipStatus::Out;
                    reason = REASON_GRACE_EXPIRED.to_string();
                    grace_expires_at = None;
                    grace_filter_id = None;
                }
                Some(expires) => {
                    reason = format!("Grace period until {}: {reason}", expires.format("%Y-%m-%d %H:%M UTC"));
                }
                None => {}
            }
        }
    } else {
        grace_expires_at = None;
    }

    // An expired grace stays the recorded reason while the user keeps failing.
    let expired_earlier = previous.is_some_and(|p| {
        p.status == MembershipStatus::Out && p.reason == REASON_GRACE_EXPIRED
    });
    if status == MembershipStatus::Out && source == MembershipSource::Auto && expired_earlier {
        reason = REASON_GRACE_EXPIRED.to_string();
    }

    let created_at = previous.map_or(now, |p| p.created_at);
    let mut next = Membership {
        group_id: group.group_id,
        user_id,
        status,
        source,
        reason,
        evidence,
        grace_expires_at,
        grace_filter_id,
        override_id,
        created_at,
        updated_at: now,
    };

    if let Some(p) = previous {
        if same_content(p, &next) {
            next.updated_at = p.updated_at;
        }
    }
    next
}

fn same_content(a: &Membership, b: &Membership) -> bool {
    a.status == b.status
        && a.source == b.source
        && a.reason == b.reason
        && a.evidence == b.evidence
        && a.grace_expires_at == b.grace_expires_at
        && a.grace_filter_id == b.grace_filter_id
        && a.override_id == b.override_id
}

fn notification_for(
    group: &SecureGroup,
    user_id: UserId,
    action: LogAction,
    reason: &str,
    grace_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Notification {
    let name = &group.name;
    let (title, message) = match action {
        LogAction::Add => (
            format!("Added to {name}"),
            format!("You are now a member of {name}. {reason}"),
        ),
        LogAction::Remove => (
            format!("Removed from {name}"),
            format!("You are no longer a member of {name}. {reason}"),
        ),
        LogAction::GraceStart => {
            let until = grace_expires_at
                .map(|t| format!(" until {}", t.format("%Y-%m-%d %H:%M UTC")))
                .unwrap_or_default();
            (
                format!("Grace period in {name}"),
                format!("You no longer meet the requirements for {name}; grace applies{until}. {reason}"),
            )
        }
        LogAction::RequestApprove => (
            format!("Application to {name} approved"),
            format!("Your application to {name} was approved. {reason}"),
        ),
        LogAction::RequestDeny => (
            format!("Application to {name} denied"),
            format!("Your application to {name} was denied. {reason}"),
        ),
    };
    Notification {
        notification_id: Uuid::new_v4(),
        user_id,
        group_id: group.group_id,
        title,
        message,
        created_at: now,
    }
}
