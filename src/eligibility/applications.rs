//! Membership applications
//!
//! Users may apply to groups with `allow_applications`. An approval is
//! applied like any other outcome with source REQUEST; a denial is recorded
//! in the log but leaves the membership row alone. Later automatic runs may
//! still revoke an approved membership.

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use crate::api::{
    ApplicationStatus, GroupId, LogAction, MembershipApplication, MembershipSource,
    MembershipStatus, SecureGroup, UserId,
};
use crate::config::EngineConfig;
use crate::eligibility::applier::{ApplyReport, MembershipApplier};
use crate::eligibility::{EligibilityOutcome, RunContext};
use crate::error::{EngineError, Result};
use crate::store::Stores;

pub const REASON_APPROVED: &str = "Application approved";
pub const REASON_DENIED: &str = "Application denied";

pub struct ApplicationDesk {
    stores: Stores,
    applier: MembershipApplier,
}

impl ApplicationDesk {
    pub fn new(stores: Stores, config: &EngineConfig) -> Self {
        Self {
            applier: MembershipApplier::new(stores.clone(), config),
            stores,
        }
    }

    pub async fn submit(
        &self,
        group_id: GroupId,
        user_id: UserId,
        note: Option<String>,
        ctx: &RunContext,
    ) -> Result<MembershipApplication> {
        let group = self.load_group(group_id).await?;
        if !group.enabled || !group.allow_applications {
            return Err(EngineError::ApplicationsClosed(group_id));
        }

        let store = &self.stores.applications;
        if store
            .pending_application(group_id, user_id)
            .await
            .context("load pending application")?
            .is_some()
        {
            return Err(EngineError::ApplicationPending { group_id, user_id });
        }

        let application = MembershipApplication {
            application_id: Uuid::new_v4(),
            group_id,
            user_id,
            status: ApplicationStatus::Pending,
            note,
            created_at: ctx.now,
            decided_at: None,
            decided_by: None,
        };
        store
            .save_application(&application)
            .await
            .context("save application")?;

        info!(group_id, user_id, application_id = %application.application_id, "Application submitted");
        Ok(application)
    }

    /// Grant membership with source REQUEST. Always logs REQUEST_APPROVE, even
    /// when the user was already IN.
    pub async fn approve(&self, application_id: Uuid, ctx: &RunContext) -> Result<ApplyReport> {
        let (application, group) = self.pending(application_id).await?;

        let report = self
            .applier
            .apply(
                &group,
                application.user_id,
                EligibilityOutcome::eligible(REASON_APPROVED, Vec::new()),
                MembershipSource::Request,
                None,
                ctx,
            )
            .await?;
        if !report.changed {
            self.applier
                .record_transition(&group, &report.membership, LogAction::RequestApprove, ctx)
                .await?;
        }

        self.decide(application, ApplicationStatus::Approved, ctx)
            .await?;
        Ok(report)
    }

    pub async fn deny(&self, application_id: Uuid, ctx: &RunContext) -> Result<MembershipApplication> {
        let (application, group) = self.pending(application_id).await?;

        let current = self
            .stores
            .memberships
            .get_membership(group.group_id, application.user_id)
            .await
            .context("load membership")?;
        let status = current.map_or(MembershipStatus::Out, |m| m.status);

        self.applier
            .record_event(
                &group,
                application.user_id,
                LogAction::RequestDeny,
                status,
                MembershipSource::Request,
                REASON_DENIED,
                None,
                ctx,
            )
            .await?;

        self.decide(application, ApplicationStatus::Denied, ctx).await
    }

    async fn pending(&self, application_id: Uuid) -> Result<(MembershipApplication, SecureGroup)> {
        let application = self
            .stores
            .applications
            .load_application(application_id)
            .await
            .context("load application")?
            .ok_or(EngineError::ApplicationNotFound(application_id))?;
        if application.status != ApplicationStatus::Pending {
            return Err(EngineError::ApplicationAlreadyDecided(application_id));
        }
        let group = self.load_group(application.group_id).await?;
        Ok((application, group))
    }

    async fn decide(
        &self,
        mut application: MembershipApplication,
        status: ApplicationStatus,
        ctx: &RunContext,
    ) -> Result<MembershipApplication> {
        application.status = status;
        application.decided_at = Some(ctx.now);
        application.decided_by = Some(ctx.actor.clone());
        self.stores
            .applications
            .save_application(&application)
            .await
            .context("save application decision")?;
        info!(
            group_id = application.group_id,
            user_id = application.user_id,
            status = status.as_str(),
            "Application decided"
        );
        Ok(application)
    }

    async fn load_group(&self, group_id: GroupId) -> Result<SecureGroup> {
        self.stores
            .catalog
            .load_group(group_id)
            .await
            .context("load group")?
            .ok_or(EngineError::GroupNotFound(group_id))
    }
}
