//! # Error Types
//!
//! Error handling for the Concord consensus protocol.

use crate::{CorrelationId, NodeId};
use thiserror::Error;

/// Error conditions arising during consensus operation.
///
/// Transient conditions (network, timeouts, missing quorum) are retryable;
/// the protocol's own re-broadcast and retry loops are the recovery path.
/// Protocol violations and configuration errors are not.
///
/// # Examples
///
/// ```rust
/// use concord_core::ConsensusError;
///
/// let error = ConsensusError::network("connection refused");
/// assert!(error.is_retryable());
/// ```
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Communication failure between nodes
    #[error("Network error: {message}")]
    Network { message: String },

    /// Wire encode/decode failure
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Consensus protocol failure
    #[error("Consensus error: {message}")]
    Consensus { message: String },

    /// Inbound message contradicting already-recorded protocol state
    #[error("Protocol violation: {details}")]
    ProtocolViolation { details: String },

    /// Referenced node is not a cluster member
    #[error("Node {node_id} not found")]
    NodeNotFound { node_id: NodeId },

    /// Referenced batch body is not locally known
    #[error("Batch {correlation_id} not found")]
    BatchNotFound { correlation_id: CorrelationId },

    /// Insufficient reachable nodes to form a quorum
    #[error("Quorum not available: {current}/{required} nodes")]
    QuorumNotAvailable { current: usize, required: usize },

    /// Invalid configuration detected at startup; fatal
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Batch integrity check failed
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Operation exceeded its deadline
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// File system or network I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, ConsensusError>;

impl ConsensusError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    pub fn consensus(message: impl Into<String>) -> Self {
        Self::Consensus {
            message: message.into(),
        }
    }

    pub fn violation(details: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            details: details.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::QuorumNotAvailable { .. }
        )
    }
}
