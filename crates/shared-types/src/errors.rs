//! Encoding errors for wire types.

use thiserror::Error;

/// Failure to produce the canonical byte form of a wire object.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// bincode refused the value.
    #[error("Canonical encoding failed: {0}")]
    Bincode(#[from] bincode::Error),
}
