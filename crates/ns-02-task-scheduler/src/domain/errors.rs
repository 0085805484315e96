//! # Domain Errors
//!
//! Transport failures reported by an `Operation`, and scheduler API errors.

use ns_01_consensus_context::ContextError;
use shared_types::RelationshipId;
use thiserror::Error;

/// Failure of one request/reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// No reply within the deadline.
    #[error("Operation timed out")]
    Timeout,

    /// The notary could not be reached.
    #[error("Connection refused")]
    ConnectionRefused,

    /// The reply could not be decoded.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// The notary refused the command signature.
    #[error("Signature rejected by notary")]
    SignatureRejected,

    /// Client and notary speak different protocol versions.
    #[error("Protocol version mismatch")]
    ProtocolVersionMismatch,
}

impl OperationError {
    /// Transient failures are retried with backoff; the rest are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionRefused | Self::MalformedReply(_)
        )
    }
}

/// Scheduler and registry errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown relationship: {0}")]
    UnknownRelationship(RelationshipId),

    #[error("Relationship already open: {0}")]
    AlreadyOpen(RelationshipId),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),
}
