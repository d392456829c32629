//! Eligibility engine
//!
//! Per (group, user) pair the pipeline is:
//!
//! ```text
//! OverrideResolver ──(active override)──────────────────────┐
//!        │ none                                              ▼
//! GroupRuleChain → FilterEvaluator (recursive) → GraceResolver → MembershipApplier
//! ```
//!
//! `BatchOrchestrator` drives the pipeline over all pairs, one group, or one
//! user. `ApplicationDesk` handles user applications, which also end in the
//! applier.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::{Evidence, FilterId, MembershipStatus};

pub mod applications;
pub mod applier;
pub mod batch;
pub mod filter_evaluator;
pub mod filters;
pub mod grace;
pub mod overrides;
pub mod rule_chain;

pub use applications::ApplicationDesk;
pub use applier::{ApplyReport, MembershipApplier};
pub use batch::{BatchOrchestrator, BatchReport, BatchScope, PairFailure, PairOutcome};
pub use filter_evaluator::{EvalContext, FilterEvaluator, FilterResult, ResultKind};
pub use filters::{BoolOperator, Filter, FilterArena, FilterKind};
pub use grace::GraceResolver;
pub use overrides::OverrideResolver;
pub use rule_chain::GroupRuleChain;

/// Who triggered the work and the instant it is evaluated at.
///
/// Passed explicitly to every operation so the actor recorded on log entries
/// and the clock used for grace/override expiry are never ambient.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub actor: String,
    pub now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self::at(actor, Utc::now())
    }

    pub fn at(actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            actor: actor.into(),
            now,
        }
    }
}

/// Result of one evaluation path (rule chain, grace or override), before it
/// is applied to the stored membership.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityOutcome {
    pub status: MembershipStatus,
    pub reason: String,
    pub evidence: Vec<Evidence>,
    pub grace_expires_at: Option<DateTime<Utc>>,
    /// Chain filter that failed; doubles as the grace trigger when in grace
    pub failed_filter_id: Option<FilterId>,
}

impl EligibilityOutcome {
    pub fn eligible(reason: impl Into<String>, evidence: Vec<Evidence>) -> Self {
        Self {
            status: MembershipStatus::In,
            reason: reason.into(),
            evidence,
            grace_expires_at: None,
            failed_filter_id: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failed_filter_id.is_some()
    }
}
