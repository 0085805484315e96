//! # Core Entities
//!
//! Identifiers and scalar types shared by every subsystem.
//!
//! ## Clusters
//!
//! - **Numbers**: `TransactionNumber`, `RequestNumber`, `Amount`
//! - **Identity**: `NymId`, `NotaryId`, `RelationshipId`
//! - **Ledger objects**: `AccountId`, `ContractId` (`UnitId`)
//! - **Integrity**: `NymboxHash`, `Signature`

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha2::{Digest, Sha256};
use std::fmt;

// =============================================================================
// NUMBERS
// =============================================================================

/// A server-issued capability to perform exactly one ledger-affecting action.
///
/// Globally unique per notary and allocated in increasing order.
pub type TransactionNumber = i64;

/// Strictly increasing per (nym, notary) pair. Embedded in every outgoing
/// command and echoed back by the notary.
pub type RequestNumber = i64;

/// Asset amount in the unit's smallest denomination.
pub type Amount = i64;

// =============================================================================
// IDENTITY
// =============================================================================

/// Client-side cryptographic identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NymId(pub String);

impl NymId {
    /// Create from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NymId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the notary (server) counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NotaryId(pub String);

impl NotaryId {
    /// Create from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One (local nym, notary) relationship. Every Context and StateMachine is
/// keyed by exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipId {
    /// Local identity.
    pub nym: NymId,
    /// Remote notary.
    pub notary: NotaryId,
}

impl RelationshipId {
    /// Pair a nym with a notary.
    pub fn new(nym: NymId, notary: NotaryId) -> Self {
        Self { nym, notary }
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.nym, self.notary)
    }
}

// =============================================================================
// LEDGER OBJECTS
// =============================================================================

/// Asset account held at a notary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    /// Create from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a signed contract (server contract or unit definition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractId(pub String);

impl ContractId {
    /// Create from any string-like identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier of a contract from its serialized body.
    pub fn for_document(document: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(document)))
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit definitions are contracts; accounts and mints are denominated in one.
pub type UnitId = ContractId;

// =============================================================================
// INTEGRITY
// =============================================================================

/// Content hash of a nym's inbound-notice box (SHA-256).
///
/// The all-zero value means "never observed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NymboxHash(pub [u8; 32]);

impl NymboxHash {
    /// Hash of a nymbox serialized as `contents`.
    pub fn of(contents: &[u8]) -> Self {
        Self(Sha256::digest(contents).into())
    }

    /// True when no nymbox has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for NymboxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A 64-byte Ed25519 signature.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde_as(as = "Bytes")] pub [u8; 64]);

impl Signature {
    /// Wrap raw signature bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..6]))
    }
}
