//! # Outbound Ports
//!
//! Dependencies the Context consumes: signing, verification and durable
//! storage. All are synchronous; the Context calls them under its own lock.

use crate::domain::SerializedContext;
use shared_types::{RelationshipId, Signature};

/// Signs preimages on behalf of the local nym.
pub trait Signer: Send + Sync {
    /// Sign `preimage`. `None` means the key is unavailable or refused.
    fn sign(&self, preimage: &[u8]) -> Option<Signature>;
}

/// Checks signatures made by a known counterparty.
pub trait Verifier: Send + Sync {
    /// True if `signature` is valid over `preimage`.
    fn verify(&self, preimage: &[u8], signature: &Signature) -> bool;
}

/// Durable storage for serialized contexts.
pub trait ContextStore: Send + Sync {
    /// Load the last stored form, if any.
    fn load_context(&self, relationship: &RelationshipId) -> Option<SerializedContext>;

    /// Persist `context`. Returns false if it was not written, including when
    /// a newer revision is already stored.
    fn store_context(&self, context: &SerializedContext) -> bool;
}
