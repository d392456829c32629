//! Group rule chain
//!
//! Runs a group's enabled filters in ascending `sort_order` and stops at the
//! first failure. Administrators control precedence by reordering entries,
//! so broad, cheap filters belong at the front.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::api::{ChainEntry, ChainEntryResult, Evidence, SecureGroup, UserFacts};
use crate::config::EngineConfig;
use crate::eligibility::filter_evaluator::{EvalContext, FilterEvaluator};
use crate::eligibility::filters::FilterArena;
use crate::eligibility::EligibilityOutcome;
use crate::store::GroupCatalog;

pub const REASON_NO_RULES: &str = "No enabled rules configured";
pub const REASON_ALL_PASSED: &str = "All rules passed";

pub struct GroupRuleChain {
    catalog: Arc<dyn GroupCatalog>,
    evaluator: FilterEvaluator,
    max_depth: usize,
}

impl GroupRuleChain {
    pub fn new(catalog: Arc<dyn GroupCatalog>, config: &EngineConfig) -> Self {
        Self {
            catalog,
            evaluator: FilterEvaluator::new(),
            max_depth: config.max_expression_depth,
        }
    }

    /// Evaluate `user` against `group`'s chain. Never fails: filter problems
    /// become failing results with their message as the reason.
    ///
    /// A failing outcome has status OUT; grace is decided afterwards by
    /// `GraceResolver`.
    pub async fn evaluate_group(
        &self,
        user: &UserFacts,
        group: &SecureGroup,
        chain: &[ChainEntry],
        arena: &FilterArena,
        now: DateTime<Utc>,
    ) -> EligibilityOutcome {
        let mut entries: Vec<&ChainEntry> = chain
            .iter()
            .filter(|e| e.enabled && e.group_id == group.group_id)
            .collect();
        entries.sort_by_key(|e| (e.sort_order, e.filter_id));

        if entries.is_empty() {
            return EligibilityOutcome::eligible(REASON_NO_RULES, Vec::new());
        }

        let mut evidence: Vec<Evidence> = Vec::with_capacity(entries.len());

        for entry in entries {
            let (pass, message, trace, name) = match arena.get(entry.filter_id) {
                Some(filter) => {
                    let mut ctx = EvalContext::with_max_depth(arena, self.max_depth);
                    let result = self.evaluator.evaluate(user, filter, &mut ctx);
                    (result.pass, result.message, result.evidence, filter.name.clone())
                }
                None => {
                    let message = format!("Filter {} not found", entry.filter_id);
                    let trace = Evidence {
                        filter_id: entry.filter_id,
                        filter_type: "missing".to_string(),
                        pass: false,
                        message: message.clone(),
                        negated: false,
                        facts: Default::default(),
                        children: Vec::new(),
                    };
                    (false, message, trace, format!("#{}", entry.filter_id))
                }
            };

            self.record(ChainEntryResult {
                group_id: group.group_id,
                filter_id: entry.filter_id,
                user_id: user.user_id,
                pass,
                message: message.clone(),
                evaluated_at: now,
            })
            .await;

            evidence.push(trace);

            if !pass {
                return EligibilityOutcome {
                    status: crate::api::MembershipStatus::Out,
                    reason: format!("{name}: {message}"),
                    evidence,
                    grace_expires_at: None,
                    failed_filter_id: Some(entry.filter_id),
                };
            }
        }

        EligibilityOutcome::eligible(REASON_ALL_PASSED, evidence)
    }

    async fn record(&self, result: ChainEntryResult) {
        if let Err(e) = self.catalog.record_chain_result(&result).await {
            warn!(
                group_id = result.group_id,
                filter_id = result.filter_id,
                "Failed to record chain result: {e:#}"
            );
        }
    }
}
