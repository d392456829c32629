//! Engine configuration
//!
//! Reads config from env vars:
//!   SECGROUPS_MAX_EXPRESSION_DEPTH nesting limit for expression filters (default: 32)
//!   SECGROUPS_MAX_CONCURRENCY      pairs evaluated concurrently per batch (default: 1)
//!   SECGROUPS_GRACE_KEEPS_ACCESS   keep downstream access while in grace (default: false)

use crate::error::{EngineError, Result};

pub const DEFAULT_MAX_EXPRESSION_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_expression_depth: usize,
    pub max_concurrency: usize,
    pub grace_keeps_access: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_expression_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
            max_concurrency: 1,
            grace_keeps_access: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_expression_depth = match lookup("SECGROUPS_MAX_EXPRESSION_DEPTH") {
            Some(v) => parse_positive("SECGROUPS_MAX_EXPRESSION_DEPTH", &v)?,
            None => defaults.max_expression_depth,
        };
        let max_concurrency = match lookup("SECGROUPS_MAX_CONCURRENCY") {
            Some(v) => parse_positive("SECGROUPS_MAX_CONCURRENCY", &v)?,
            None => defaults.max_concurrency,
        };
        let grace_keeps_access = match lookup("SECGROUPS_GRACE_KEEPS_ACCESS") {
            Some(v) => parse_flag("SECGROUPS_GRACE_KEEPS_ACCESS", &v)?,
            None => defaults.grace_keeps_access,
        };

        Ok(Self {
            max_expression_depth,
            max_concurrency,
            grace_keeps_access,
        })
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_max_expression_depth(mut self, depth: usize) -> Self {
        self.max_expression_depth = depth;
        self
    }

    pub fn with_grace_keeps_access(mut self, keep: bool) -> Self {
        self.grace_keeps_access = keep;
        self
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(EngineError::InvalidConfig(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::InvalidConfig(format!(
            "{key} must be a boolean, got '{value}'"
        ))),
    }
}
