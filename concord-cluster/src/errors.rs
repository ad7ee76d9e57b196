//! Error types for cluster coordination.

use thiserror::Error;

/// Result type for cluster coordination operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors arising from topology tracking and leader management
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Leader election could not complete
    #[error("Leader election failed: {reason}")]
    ElectionFailed { reason: String },

    /// Leader proposal could not be submitted through consensus
    #[error("Leader proposal submission failed: {reason}")]
    SubmissionFailed { reason: String },

    /// Cluster topology error
    #[error("Cluster topology error: {reason}")]
    TopologyError { reason: String },

    /// Configuration error; fatal at startup
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// Internal system error
    #[error("Internal system error: {reason}")]
    Internal { reason: String },
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        ClusterError::Internal {
            reason: err.to_string(),
        }
    }
}

impl From<concord_core::ConsensusError> for ClusterError {
    fn from(err: concord_core::ConsensusError) -> Self {
        ClusterError::SubmissionFailed {
            reason: err.to_string(),
        }
    }
}
