//! Error types for the eligibility engine
//!
//! Filter and chain problems are not errors: they resolve to failing results
//! with a message. `EngineError` covers what is left: missing targets,
//! application workflow violations, and storage faults.

use thiserror::Error;
use uuid::Uuid;

use crate::api::{GroupId, UserId};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("group {0} does not accept applications")]
    ApplicationsClosed(GroupId),

    #[error("user {user_id} already has a pending application for group {group_id}")]
    ApplicationPending { group_id: GroupId, user_id: UserId },

    #[error("application {0} not found")]
    ApplicationNotFound(Uuid),

    #[error("application {0} has already been decided")]
    ApplicationAlreadyDecided(Uuid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Faults worth retrying on a later run, as opposed to caller mistakes
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
