//! Error types for the Sluice service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy that can never be enforced sensibly
    #[error("Invalid rate limit policy '{policy}': {reason}")]
    InvalidPolicy {
        /// Identifier of the offending policy
        policy: String,
        /// Why the policy was rejected
        reason: String,
    },

    /// Shared store errors surfaced on administrative paths
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SluiceError {
    pub(crate) fn invalid_policy(policy: &str, reason: impl Into<String>) -> Self {
        SluiceError::InvalidPolicy {
            policy: policy.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
