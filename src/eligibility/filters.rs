//! Typed filter definitions
//!
//! Filter rows store a type string and a JSON config blob. Both are parsed
//! once per run into `FilterKind`, so evaluation dispatches on a variant
//! instead of re-reading loosely-typed maps. Rows that do not parse still
//! produce a `Filter` (`Unknown` / `Invalid`) that evaluates as a failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::api::{
    AllianceId, CharacterId, CorporationId, FilterId, FilterRecord, PermissionGroupId,
};

pub const TYPE_ALT_CORP: &str = "alt_corp";
pub const TYPE_ALT_ALLIANCE: &str = "alt_alliance";
pub const TYPE_PERMISSION_GROUP: &str = "permission_group";
pub const TYPE_EXPRESSION: &str = "expression";

/// Boolean combinator for expression filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOperator {
    #[default]
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
    #[serde(alias = "xor")]
    Xor,
}

impl BoolOperator {
    pub fn apply(self, left: bool, right: bool) -> bool {
        match self {
            Self::And => left && right,
            Self::Or => left || right,
            Self::Xor => left ^ right,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// Passes if any non-exempt character of the user is in the corporation
    AltCorp {
        corporation_id: Option<CorporationId>,
        exempt_character_ids: Vec<CharacterId>,
    },
    /// Passes if any non-exempt character of the user is in the alliance
    AltAlliance {
        alliance_id: Option<AllianceId>,
        exempt_character_ids: Vec<CharacterId>,
    },
    /// Passes if the user belongs to any of the downstream permission groups
    PermissionGroup { group_ids: Vec<PermissionGroupId> },
    /// Combines two other filters by reference
    Expression {
        left: Option<FilterId>,
        right: Option<FilterId>,
        operator: BoolOperator,
    },
    Unknown { filter_type: String },
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub filter_id: FilterId,
    pub name: String,
    pub filter_type: String,
    pub kind: FilterKind,
    pub negate: bool,
    pub grace_period_days: Option<u32>,
}

// Config blob shapes, one per type. Unknown keys are ignored.

#[derive(Deserialize, Default)]
struct CommonConfig {
    #[serde(default)]
    negate: bool,
}

#[derive(Deserialize)]
struct AltCorpConfig {
    #[serde(default)]
    corporation_id: Option<CorporationId>,
    #[serde(default)]
    exempt_character_ids: Vec<CharacterId>,
}

#[derive(Deserialize)]
struct AltAllianceConfig {
    #[serde(default)]
    alliance_id: Option<AllianceId>,
    #[serde(default)]
    exempt_character_ids: Vec<CharacterId>,
}

#[derive(Deserialize)]
struct PermissionGroupConfig {
    #[serde(default)]
    group_ids: Vec<PermissionGroupId>,
}

#[derive(Deserialize)]
struct ExpressionConfig {
    #[serde(default)]
    left: Option<FilterId>,
    #[serde(default)]
    right: Option<FilterId>,
    #[serde(default)]
    operator: BoolOperator,
}

impl Filter {
    pub fn from_record(record: &FilterRecord) -> Self {
        let config = match &record.config {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other.clone(),
        };

        let negate = serde_json::from_value::<CommonConfig>(config.clone())
            .unwrap_or_default()
            .negate;

        let kind = match parse_kind(&record.filter_type, config) {
            Ok(kind) => kind,
            Err(e) => FilterKind::Invalid {
                reason: e.to_string(),
            },
        };

        Self {
            filter_id: record.filter_id,
            name: record.name.clone(),
            filter_type: record.filter_type.clone(),
            kind,
            negate,
            grace_period_days: record.grace_period_days,
        }
    }
}

fn parse_kind(filter_type: &str, config: JsonValue) -> Result<FilterKind, serde_json::Error> {
    let kind = match filter_type {
        TYPE_ALT_CORP => {
            let c: AltCorpConfig = serde_json::from_value(config)?;
            FilterKind::AltCorp {
                corporation_id: c.corporation_id,
                exempt_character_ids: c.exempt_character_ids,
            }
        }
        TYPE_ALT_ALLIANCE => {
            let c: AltAllianceConfig = serde_json::from_value(config)?;
            FilterKind::AltAlliance {
                alliance_id: c.alliance_id,
                exempt_character_ids: c.exempt_character_ids,
            }
        }
        TYPE_PERMISSION_GROUP | "user_group" => {
            let c: PermissionGroupConfig = serde_json::from_value(config)?;
            FilterKind::PermissionGroup {
                group_ids: c.group_ids,
            }
        }
        TYPE_EXPRESSION => {
            let c: ExpressionConfig = serde_json::from_value(config)?;
            FilterKind::Expression {
                left: c.left,
                right: c.right,
                operator: c.operator,
            }
        }
        other => FilterKind::Unknown {
            filter_type: other.to_string(),
        },
    };
    Ok(kind)
}

/// Every filter of a run, indexed by id. Expressions resolve operands here.
#[derive(Debug, Clone, Default)]
pub struct FilterArena {
    filters: HashMap<FilterId, Filter>,
}

impl FilterArena {
    pub fn from_records(records: &[FilterRecord]) -> Self {
        let filters = records
            .iter()
            .map(|r| (r.filter_id, Filter::from_record(r)))
            .collect();
        Self { filters }
    }

    pub fn get(&self, filter_id: FilterId) -> Option<&Filter> {
        self.filters.get(&filter_id)
    }

    pub fn insert(&mut self, filter: Filter) {
        self.filters.insert(filter.filter_id, filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
