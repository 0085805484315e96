//! # Domain Errors
//!
//! Errors raised at Context construction and load boundaries. Runtime
//! mutators report failure through their `bool`/`Option` return values.

use shared_types::RelationshipId;
use thiserror::Error;

/// Consensus context errors.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A persisted context belongs to a different relationship.
    #[error("Context identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch {
        /// Relationship the caller asked for.
        expected: RelationshipId,
        /// Relationship recorded in the persisted form.
        found: RelationshipId,
    },

    /// Persisted format version this build cannot read.
    #[error("Unsupported context version: {0}")]
    UnsupportedVersion(u32),

    /// Backing store could not be opened or read.
    #[error("Context storage error: {0}")]
    Storage(String),

    /// Key material was rejected.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for ContextError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
