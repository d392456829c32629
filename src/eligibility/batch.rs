//! Batch orchestration
//!
//! Drives Override → Chain → Grace → Apply over (group × user) pairs. The
//! three entry points differ only in which pairs they enumerate. Per-pair
//! errors are recorded in the report and never abort the run.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::api::{
    ChainEntry, CharacterFacts, GroupId, MembershipSource, MembershipStatus, SecureGroup,
    UserFacts, UserId,
};
use crate::config::EngineConfig;
use crate::eligibility::applier::{ApplyReport, MembershipApplier};
use crate::eligibility::filters::FilterArena;
use crate::eligibility::grace::GraceResolver;
use crate::eligibility::overrides::OverrideResolver;
use crate::eligibility::rule_chain::GroupRuleChain;
use crate::eligibility::RunContext;
use crate::error::{EngineError, Result};
use crate::store::Stores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BatchScope {
    All,
    Group(GroupId),
    User(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairFailure {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub error: String,
}

/// What happened to one pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairOutcome {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub status: MembershipStatus,
    pub previous: Option<MembershipStatus>,
    pub source: MembershipSource,
    pub changed: bool,
    pub reason: String,
}

impl From<ApplyReport> for PairOutcome {
    fn from(report: ApplyReport) -> Self {
        Self {
            group_id: report.membership.group_id,
            user_id: report.membership.user_id,
            status: report.membership.status,
            previous: report.previous,
            source: report.membership.source,
            changed: report.changed,
            reason: report.membership.reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub scope: BatchScope,
    pub pairs_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status_changes: usize,
    pub overrides_applied: usize,
    pub failures: Vec<PairFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    fn new(ctx: &RunContext, scope: BatchScope) -> Self {
        Self {
            run_id: ctx.run_id,
            scope,
            pairs_processed: 0,
            succeeded: 0,
            failed: 0,
            status_changes: 0,
            overrides_applied: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn record(&mut self, group_id: GroupId, user_id: UserId, result: Result<PairOutcome>) {
        match result {
            Ok(outcome) => {
                self.pairs_processed += 1;
                self.succeeded += 1;
                if outcome.changed {
                    self.status_changes += 1;
                }
                if outcome.source == MembershipSource::Override {
                    self.overrides_applied += 1;
                }
            }
            Err(e) => {
                self.record_failure(group_id, user_id, e.to_string());
            }
        }
    }

    fn record_failure(&mut self, group_id: GroupId, user_id: UserId, error: String) {
        error!(group_id, user_id, "Pair evaluation failed: {error}");
        self.pairs_processed += 1;
        self.failed += 1;
        self.failures.push(PairFailure {
            group_id,
            user_id,
            error,
        });
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// A group with its parsed chain, ready to evaluate users against
struct PreparedGroup {
    group: SecureGroup,
    chain: Vec<ChainEntry>,
}

pub struct BatchOrchestrator {
    stores: Stores,
    max_concurrency: usize,
    overrides: OverrideResolver,
    rule_chain: GroupRuleChain,
    grace: GraceResolver,
    applier: MembershipApplier,
}

impl BatchOrchestrator {
    pub fn new(stores: Stores, config: EngineConfig) -> Self {
        Self {
            overrides: OverrideResolver::new(stores.overrides.clone()),
            rule_chain: GroupRuleChain::new(stores.catalog.clone(), &config),
            grace: GraceResolver::new(),
            applier: MembershipApplier::new(stores.clone(), &config),
            max_concurrency: config.max_concurrency.max(1),
            stores,
        }
    }

    /// Every enabled group × every user.
    pub async fn evaluate_all(&self, ctx: &RunContext) -> Result<BatchReport> {
        let groups = self.enabled_groups().await?;
        let users = self.all_users().await?;
        self.run(BatchScope::All, groups, users, ctx).await
    }

    /// One group × every user. A disabled group yields an empty report.
    pub async fn evaluate_group(&self, group_id: GroupId, ctx: &RunContext) -> Result<BatchReport> {
        let group = self.require_group(group_id).await?;
        if !group.enabled {
            warn!(group_id, "Skipping evaluation of disabled group");
            return self.run(BatchScope::Group(group_id), Vec::new(), Vec::new(), ctx).await;
        }
        let users = self.all_users().await?;
        self.run(BatchScope::Group(group_id), vec![group], users, ctx)
            .await
    }

    /// Every enabled group × one user. Ids the fact source does not list are rejected.
    pub async fn evaluate_user(&self, user_id: UserId, ctx: &RunContext) -> Result<BatchReport> {
        self.require_user(user_id).await?;
        let groups = self.enabled_groups().await?;
        self.run(BatchScope::User(user_id), groups, vec![user_id], ctx)
            .await
    }

    /// Single pair, with errors returned to the caller rather than counted.
    pub async fn evaluate_pair(
        &self,
        group_id: GroupId,
        user_id: UserId,
        ctx: &RunContext,
    ) -> Result<PairOutcome> {
        let group = self.require_group(group_id).await?;
        self.require_user(user_id).await?;
        let arena = self.load_arena().await?;
        let prepared = self.prepare(group).await?;
        let facts = self.load_user_facts(user_id).await?;
        self.evaluate_prepared(&prepared, &arena, &facts, ctx).await
    }

    // ── Enumeration ──

    async fn run(
        &self,
        scope: BatchScope,
        groups: Vec<SecureGroup>,
        users: Vec<UserId>,
        ctx: &RunContext,
    ) -> Result<BatchReport> {
        let span = info_span!("eligibility_run", run_id = %ctx.run_id, actor = %ctx.actor);
        async move {
            let mut report = BatchReport::new(ctx, scope);
            info!(
                ?scope,
                groups = groups.len(),
                users = users.len(),
                "Starting eligibility run"
            );

            let arena = self.load_arena().await?;
            let mut prepared = Vec::with_capacity(groups.len());
            for group in groups {
                prepared.push(self.prepare(group).await?);
            }

            // Facts are loaded once per user and shared across groups.
            let mut facts: HashMap<UserId, UserFacts> = HashMap::with_capacity(users.len());
            for &user_id in &users {
                match self.load_user_facts(user_id).await {
                    Ok(f) => {
                        facts.insert(user_id, f);
                    }
                    Err(e) => {
                        let message = e.to_string();
                        for p in &prepared {
                            report.record_failure(p.group.group_id, user_id, message.clone());
                        }
                    }
                }
            }

            let pairs: Vec<(&PreparedGroup, &UserFacts)> = prepared
                .iter()
                .flat_map(|p| users.iter().filter_map(|u| facts.get(u)).map(move |f| (p, f)))
                .collect();

            let arena = &arena;
            let results: Vec<_> = stream::iter(pairs)
                .map(|(p, f)| async move {
                    let result = self.evaluate_prepared(p, arena, f, ctx).await;
                    (p.group.group_id, f.user_id, result)
                })
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

            for (group_id, user_id, result) in results {
                report.record(group_id, user_id, result);
            }

            report.finished_at = Utc::now();
            info!(
                pairs = report.pairs_processed,
                succeeded = report.succeeded,
                failed = report.failed,
                changes = report.status_changes,
                overrides = report.overrides_applied,
                "Eligibility run complete"
            );
            Ok::<_, EngineError>(report)
        }
        .instrument(span)
        .await
    }

    // ── Per-pair pipeline ──

    async fn evaluate_prepared(
        &self,
        prepared: &PreparedGroup,
        arena: &FilterArena,
        user: &UserFacts,
        ctx: &RunContext,
    ) -> Result<PairOutcome> {
        let group = &prepared.group;

        if let Some(ov) = self
            .overrides
            .resolve(group.group_id, user.user_id, ctx.now)
            .await?
        {
            debug!(
                group_id = group.group_id,
                user_id = user.user_id,
                override_id = ov.override_id,
                "Override takes precedence"
            );
            let outcome = self.overrides.outcome_for(&ov);
            let report = self
                .applier
                .apply(
                    group,
                    user.user_id,
                    outcome,
                    MembershipSource::Override,
                    Some(ov.override_id),
                    ctx,
                )
                .await?;
            return Ok(report.into());
        }

        let outcome = self
            .rule_chain
            .evaluate_group(user, group, &prepared.chain, arena, ctx.now)
            .await;
        let failed_filter = outcome.failed_filter_id.and_then(|id| arena.get(id));
        let outcome = self.grace.resolve(group, failed_filter, outcome, ctx.now);

        let report = self
            .applier
            .apply(group, user.user_id, outcome, MembershipSource::Auto, None, ctx)
            .await?;
        Ok(report.into())
    }

    // ── Loading ──

    async fn require_group(&self, group_id: GroupId) -> Result<SecureGroup> {
        self.stores
            .catalog
            .load_group(group_id)
            .await
            .context("load group")?
            .ok_or(EngineError::GroupNotFound(group_id))
    }

    async fn require_user(&self, user_id: UserId) -> Result<()> {
        if self.all_users().await?.contains(&user_id) {
            Ok(())
        } else {
            Err(EngineError::UserNotFound(user_id))
        }
    }

    async fn enabled_groups(&self) -> Result<Vec<SecureGroup>> {
        let groups = self.stores.catalog.list_groups().await.context("list groups")?;
        Ok(groups.into_iter().filter(|g| g.enabled).collect())
    }

    async fn all_users(&self) -> Result<Vec<UserId>> {
        Ok(self.stores.facts.list_users().await.context("list users")?)
    }

    async fn load_arena(&self) -> Result<FilterArena> {
        let records = self
            .stores
            .catalog
            .load_filters()
            .await
            .context("load filters")?;
        Ok(FilterArena::from_records(&records))
    }

    async fn prepare(&self, group: SecureGroup) -> Result<PreparedGroup> {
        let chain = self
            .stores
            .catalog
            .load_chain(group.group_id)
            .await
            .with_context(|| format!("load chain for group {}", group.group_id))?;
        Ok(PreparedGroup { group, chain })
    }

    /// Point-in-time snapshot of a user's characters, org facts and
    /// permission groups.
    pub async fn load_user_facts(&self, user_id: UserId) -> Result<UserFacts> {
        let facts = &self.stores.facts;
        let characters = facts
            .load_characters(user_id)
            .await
            .with_context(|| format!("load characters for user {user_id}"))?;
        let ids: Vec<_> = characters.iter().map(|c| c.character_id).collect();
        let org: HashMap<_, _> = facts
            .load_org_facts(&ids)
            .await
            .with_context(|| format!("load org facts for user {user_id}"))?
            .into_iter()
            .map(|f| (f.character_id, f))
            .collect();
        let permission_groups = self
            .stores
            .permissions
            .groups_for_user(user_id)
            .await
            .with_context(|| format!("load permission groups for user {user_id}"))?;

        Ok(UserFacts {
            user_id,
            characters: characters
                .into_iter()
                .map(|c| CharacterFacts {
                    character_id: c.character_id,
                    is_main: c.is_main,
                    org: org.get(&c.character_id).copied(),
                })
                .collect(),
            permission_groups: permission_groups.into_iter().collect(),
        })
    }
}
