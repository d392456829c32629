//! Filter evaluator: pure Rust, no DB dependency
//!
//! Evaluates one filter for one user against a `UserFacts` snapshot.
//! Leaf filters read character/org facts or downstream permission groups;
//! expression filters recursively evaluate two operands from the
//! `FilterArena` and combine them.
//!
//! Results carry a `ResultKind` so callers can tell "ineligible" apart from
//! "unknown" (missing facts) and "broken" (configuration errors). Negation
//! applies to evaluated and missing-data results alike, keeping their kind;
//! configuration errors always fail closed.

use std::collections::BTreeMap;

use serde_json::{json, Value as JsonValue};

use crate::api::{CharacterId, Evidence, FilterId, UserFacts};
use crate::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use crate::eligibility::filters::{BoolOperator, Filter, FilterArena, FilterKind};

pub const MSG_MISSING_CORP_DATA: &str = "Missing corp or character data";
pub const MSG_MISSING_ALLIANCE_DATA: &str = "Missing alliance or character data";
pub const MSG_NO_CHARACTER_IN_CORP: &str = "No character in required corp";
pub const MSG_NO_CHARACTER_IN_ALLIANCE: &str = "No character in required alliance";
pub const MSG_UNKNOWN_FILTER: &str = "Unknown filter";
pub const NEGATION_PREFIX: &str = "Negated: ";

/// How a filter result was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Facts were present and the rule was applied
    Evaluated,
    /// Required facts or policy target absent
    MissingData,
    /// Unknown type, bad config, missing operand, cycle
    ConfigError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub pass: bool,
    pub message: String,
    pub kind: ResultKind,
    pub evidence: Evidence,
}

/// Per-evaluation state: the filter arena and the current expression path.
pub struct EvalContext<'a> {
    arena: &'a FilterArena,
    max_depth: usize,
    path: Vec<FilterId>,
}

impl<'a> EvalContext<'a> {
    pub fn new(arena: &'a FilterArena) -> Self {
        Self::with_max_depth(arena, DEFAULT_MAX_EXPRESSION_DEPTH)
    }

    pub fn with_max_depth(arena: &'a FilterArena, max_depth: usize) -> Self {
        Self {
            arena,
            max_depth,
            path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterEvaluator;

impl FilterEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, user: &UserFacts, filter: &Filter, ctx: &mut EvalContext<'_>) -> FilterResult {
        // A filter already on the current expression path means a reference cycle.
        if ctx.path.contains(&filter.filter_id) {
            return fail(
                filter,
                ResultKind::ConfigError,
                format!("Cycle detected at filter {}", filter.filter_id),
                BTreeMap::from([("path".to_string(), json!(ctx.path))]),
                Vec::new(),
            );
        }
        if ctx.path.len() >= ctx.max_depth {
            return fail(
                filter,
                ResultKind::ConfigError,
                "Expression depth limit exceeded".to_string(),
                BTreeMap::from([("max_depth".to_string(), json!(ctx.max_depth))]),
                Vec::new(),
            );
        }

        ctx.path.push(filter.filter_id);
        let result = self.evaluate_kind(user, filter, ctx);
        ctx.path.pop();

        negate_if_configured(filter, result)
    }

    fn evaluate_kind(
        &self,
        user: &UserFacts,
        filter: &Filter,
        ctx: &mut EvalContext<'_>,
    ) -> FilterResult {
        match &filter.kind {
            FilterKind::AltCorp {
                corporation_id,
                exempt_character_ids,
            } => {
                let Some(required) = *corporation_id else {
                    return fail(
                        filter,
                        ResultKind::MissingData,
                        "No corporation configured".to_string(),
                        BTreeMap::new(),
                        Vec::new(),
                    );
                };
                evaluate_alt(
                    user,
                    filter,
                    "corporation_id",
                    required,
                    exempt_character_ids,
                    |org| Some(org.corporation_id),
                    AltMessages {
                        missing: MSG_MISSING_CORP_DATA,
                        no_match: MSG_NO_CHARACTER_IN_CORP,
                        matched: "in required corp",
                    },
                )
            }
            FilterKind::AltAlliance {
                alliance_id,
                exempt_character_ids,
            } => {
                let Some(required) = *alliance_id else {
                    return fail(
                        filter,
                        ResultKind::MissingData,
                        "No alliance configured".to_string(),
                        BTreeMap::new(),
                        Vec::new(),
                    );
                };
                evaluate_alt(
                    user,
                    filter,
                    "alliance_id",
                    required,
                    exempt_character_ids,
                    |org| org.alliance_id,
                    AltMessages {
                        missing: MSG_MISSING_ALLIANCE_DATA,
                        no_match: MSG_NO_CHARACTER_IN_ALLIANCE,
                        matched: "in required alliance",
                    },
                )
            }
            FilterKind::PermissionGroup { group_ids } => {
                if group_ids.is_empty() {
                    return fail(
                        filter,
                        ResultKind::MissingData,
                        "No permission groups configured".to_string(),
                        BTreeMap::new(),
                        Vec::new(),
                    );
                }
                let mut facts = BTreeMap::new();
                facts.insert("required_group_ids".to_string(), json!(group_ids));
                facts.insert(
                    "user_group_ids".to_string(),
                    json!(user.permission_groups.iter().collect::<Vec<_>>()),
                );
                match group_ids
                    .iter()
                    .find(|id| user.permission_groups.contains(id))
                {
                    Some(matched) => {
                        facts.insert("matched_group_id".to_string(), json!(matched));
                        result(
                            filter,
                            true,
                            ResultKind::Evaluated,
                            format!("User in permission group {matched}"),
                            facts,
                            Vec::new(),
                        )
                    }
                    None => result(
                        filter,
                        false,
                        ResultKind::Evaluated,
                        "User not in any required permission group".to_string(),
                        facts,
                        Vec::new(),
                    ),
                }
            }
            FilterKind::Expression {
                left,
                right,
                operator,
            } => self.evaluate_expression(user, filter, *left, *right, *operator, ctx),
            FilterKind::Unknown { filter_type } => fail(
                filter,
                ResultKind::ConfigError,
                MSG_UNKNOWN_FILTER.to_string(),
                BTreeMap::from([("filter_type".to_string(), json!(filter_type))]),
                Vec::new(),
            ),
            FilterKind::Invalid { reason } => fail(
                filter,
                ResultKind::ConfigError,
                format!("Invalid filter configuration: {reason}"),
                BTreeMap::new(),
                Vec::new(),
            ),
        }
    }

    /// Full (non short-circuit) evaluation: both operands always run so their
    /// evidence is captured.
    fn evaluate_expression(
        &self,
        user: &UserFacts,
        filter: &Filter,
        left: Option<FilterId>,
        right: Option<FilterId>,
        operator: BoolOperator,
        ctx: &mut EvalContext<'_>,
    ) -> FilterResult {
        let facts = BTreeMap::from([("operator".to_string(), json!(operator.as_str()))]);

        let (Some(left_id), Some(right_id)) = (left, right) else {
            let side = if left.is_none() { "left" } else { "right" };
            return fail(
                filter,
                ResultKind::ConfigError,
                format!("Expression missing {side} operand"),
                facts,
                Vec::new(),
            );
        };

        let left_result = self.evaluate_operand(user, left_id, ctx);
        let right_result = self.evaluate_operand(user, right_id, ctx);

        let broken = [&left_result, &right_result]
            .into_iter()
            .find(|r| r.kind == ResultKind::ConfigError)
            .map(|r| r.message.clone());
        let children = vec![left_result.evidence, right_result.evidence];

        if let Some(reason) = broken {
            return fail(
                filter,
                ResultKind::ConfigError,
                format!("{} expression has invalid operand: {reason}", operator.as_str()),
                facts,
                children,
            );
        }

        let pass = operator.apply(left_result.pass, right_result.pass);
        result(
            filter,
            pass,
            ResultKind::Evaluated,
            format!(
                "({}) {} ({})",
                left_result.message,
                operator.as_str(),
                right_result.message
            ),
            facts,
            children,
        )
    }

    fn evaluate_operand(
        &self,
        user: &UserFacts,
        filter_id: FilterId,
        ctx: &mut EvalContext<'_>,
    ) -> FilterResult {
        let arena = ctx.arena;
        match arena.get(filter_id) {
            Some(operand) => self.evaluate(user, operand, ctx),
            None => FilterResult {
                pass: false,
                message: format!("Referenced filter {filter_id} not found"),
                kind: ResultKind::ConfigError,
                evidence: Evidence {
                    filter_id,
                    filter_type: "missing".to_string(),
                    pass: false,
                    message: format!("Referenced filter {filter_id} not found"),
                    negated: false,
                    facts: BTreeMap::new(),
                    children: Vec::new(),
                },
            },
        }
    }
}

struct AltMessages {
    missing: &'static str,
    no_match: &'static str,
    matched: &'static str,
}

/// Shared body of the corp and alliance "any alt" checks.
fn evaluate_alt(
    user: &UserFacts,
    filter: &Filter,
    target_key: &str,
    required: i64,
    exempt: &[CharacterId],
    project: impl Fn(&crate::api::CharacterOrgFacts) -> Option<i64>,
    messages: AltMessages,
) -> FilterResult {
    let mut facts = BTreeMap::new();
    facts.insert(format!("required_{target_key}"), json!(required));
    if !exempt.is_empty() {
        facts.insert("exempt_character_ids".to_string(), json!(exempt));
    }

    if !user.has_org_facts() {
        facts.insert(
            "character_ids".to_string(),
            json!(user.characters.iter().map(|c| c.character_id).collect::<Vec<_>>()),
        );
        return fail(
            filter,
            ResultKind::MissingData,
            messages.missing.to_string(),
            facts,
            Vec::new(),
        );
    }

    let mut checked: Vec<JsonValue> = Vec::new();
    let mut matched = None;
    for character in &user.characters {
        let Some(org) = &character.org else { continue };
        if exempt.contains(&character.character_id) {
            continue;
        }
        let value = project(org);
        checked.push(json!({"character_id": character.character_id, target_key: value}));
        if value == Some(required) {
            matched = Some(character.character_id);
            break;
        }
    }
    facts.insert("checked".to_string(), JsonValue::Array(checked));

    match matched {
        Some(character_id) => {
            facts.insert("matched_character_id".to_string(), json!(character_id));
            result(
                filter,
                true,
                ResultKind::Evaluated,
                format!("Character {character_id} {}", messages.matched),
                facts,
                Vec::new(),
            )
        }
        None => result(
            filter,
            false,
            ResultKind::Evaluated,
            messages.no_match.to_string(),
            facts,
            Vec::new(),
        ),
    }
}

fn result(
    filter: &Filter,
    pass: bool,
    kind: ResultKind,
    message: String,
    facts: BTreeMap<String, JsonValue>,
    children: Vec<Evidence>,
) -> FilterResult {
    FilterResult {
        pass,
        kind,
        evidence: Evidence {
            filter_id: filter.filter_id,
            filter_type: filter.filter_type.clone(),
            pass,
            message: message.clone(),
            negated: false,
            facts,
            children,
        },
        message,
    }
}

fn fail(
    filter: &Filter,
    kind: ResultKind,
    message: String,
    facts: BTreeMap<String, JsonValue>,
    children: Vec<Evidence>,
) -> FilterResult {
    result(filter, false, kind, message, facts, children)
}

fn negate_if_configured(filter: &Filter, mut result: FilterResult) -> FilterResult {
    if !filter.negate {
        return result;
    }
    if result.kind == ResultKind::ConfigError {
        result
            .evidence
            .facts
            .insert("negation_skipped".to_string(), json!(true));
        return result;
    }
    result.pass = !result.pass;
    result.message = format!("{NEGATION_PREFIX}{}", result.message);
    result.evidence.pass = result.pass;
    result.evidence.message = result.message.clone();
    result.evidence.negated = true;
    result
}
