//! Error types for fleetpace.

use thiserror::Error;

use crate::model::{CampaignId, IdentityId, PostId};

/// fleetpace error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Identity is busy with another operation
    #[error("identity {identity} is already locked (held: {})", format_held(.held))]
    LockContention {
        identity: IdentityId,
        held: Vec<IdentityId>,
    },

    /// No identity in the fleet can take the work
    #[error("no eligible identities available ({context})")]
    NoEligibleIdentities { context: String },

    /// Campaign task not found
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Task id that does not parse
    #[error("invalid task id: {id}")]
    InvalidTaskId { id: String },

    /// Identity not found
    #[error("identity not found: {id}")]
    IdentityNotFound { id: IdentityId },

    /// Campaign not found
    #[error("campaign not found: {id}")]
    CampaignNotFound { id: CampaignId },

    /// Post not found
    #[error("post not found: {id}")]
    PostNotFound { id: PostId },

    /// Post already handed to the distribution scheduler
    #[error("post {id} is already scheduled")]
    AlreadyScheduled { id: PostId },

    /// Component refuses new work after shutdown
    #[error("shutting down")]
    ShuttingDown,

    /// Campaign or component misconfiguration
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence layer failure
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_held(held: &[IdentityId]) -> String {
    held.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
}

/// Result type alias for fleetpace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_lists_holders() {
        let err = Error::LockContention {
            identity: IdentityId::new("a"),
            held: vec![IdentityId::new("a"), IdentityId::new("b")],
        };
        assert_eq!(err.to_string(), "identity a is already locked (held: a, b)");
    }
}
