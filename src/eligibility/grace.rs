//! Grace resolution for failed rule chains
//!
//! Decides whether a failing user drops straight OUT or gets a grace
//! deadline. Expiry of an existing grace period is not decided here: it needs
//! the stored deadline, so the applier handles it.

use chrono::{DateTime, Duration, Utc};

use crate::api::{MembershipStatus, SecureGroup};
use crate::eligibility::filters::Filter;
use crate::eligibility::EligibilityOutcome;

#[derive(Debug, Clone, Copy, Default)]
pub struct GraceResolver;

impl GraceResolver {
    pub fn new() -> Self {
        Self
    }

    /// Grace days for a failure: the failing filter's own period when
    /// positive, else the group default. Zero when the group has no grace.
    pub fn grace_days(&self, group: &SecureGroup, failed_filter: Option<&Filter>) -> u32 {
        if !group.can_grace {
            return 0;
        }
        failed_filter
            .and_then(|f| f.grace_period_days)
            .filter(|days| *days > 0)
            .unwrap_or(group.grace_default_days)
    }

    /// Turn a failing chain outcome into GRACE or OUT. Passing outcomes are
    /// returned untouched.
    pub fn resolve(
        &self,
        group: &SecureGroup,
        failed_filter: Option<&Filter>,
        mut outcome: EligibilityOutcome,
        now: DateTime<Utc>,
    ) -> EligibilityOutcome {
        if !outcome.is_failure() {
            return outcome;
        }

        let days = self.grace_days(group, failed_filter);
        if days == 0 {
            outcome.status = MembershipStatus::Out;
            outcome.grace_expires_at = None;
            return outcome;
        }

        outcome.status = MembershipStatus::Grace;
        outcome.grace_expires_at = Some(now + Duration::days(i64::from(days)));
        outcome
    }
}
