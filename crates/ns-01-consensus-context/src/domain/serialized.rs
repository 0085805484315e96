//! # Persisted and Snapshot Forms
//!
//! `SerializedContext` is what a `ContextStore` keeps. `ContextSnapshot` is
//! the read-only view handed to callers that only want to look.

use serde::{Deserialize, Serialize};
use shared_types::{NymboxHash, RelationshipId, RequestNumber, TransactionNumber};
use std::collections::BTreeSet;

/// Current persisted format version.
pub const CONTEXT_VERSION: u32 = 1;

/// Durable form of a Context.
///
/// Admin session state is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedContext {
    pub version: u32,
    pub relationship: RelationshipId,
    pub revision: u64,
    pub request_number: RequestNumber,
    pub highest: TransactionNumber,
    pub issued: BTreeSet<TransactionNumber>,
    pub tentative: BTreeSet<TransactionNumber>,
    /// Numbers held by a ManagedNumber when this form was written.
    pub checked_out: BTreeSet<TransactionNumber>,
    pub acknowledged: BTreeSet<RequestNumber>,
    pub local_nymbox_hash: NymboxHash,
    pub remote_nymbox_hash: NymboxHash,
}

impl SerializedContext {
    /// Empty record for a brand-new relationship.
    pub fn empty(relationship: RelationshipId) -> Self {
        Self {
            version: CONTEXT_VERSION,
            relationship,
            revision: 0,
            request_number: 0,
            highest: 0,
            issued: BTreeSet::new(),
            tentative: BTreeSet::new(),
            checked_out: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            local_nymbox_hash: NymboxHash::default(),
            remote_nymbox_hash: NymboxHash::default(),
        }
    }
}

/// Point-in-time, read-only view of a Context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub relationship: RelationshipId,
    pub revision: u64,
    pub request_number: RequestNumber,
    pub highest: TransactionNumber,
    /// Spendable numbers.
    pub issued: BTreeSet<TransactionNumber>,
    pub tentative: BTreeSet<TransactionNumber>,
    pub checked_out: BTreeSet<TransactionNumber>,
    pub acknowledged: BTreeSet<RequestNumber>,
    pub nymbox_in_sync: bool,
    pub stale: bool,
    pub unusable: bool,
    pub admin: bool,
}

impl ContextSnapshot {
    /// How many numbers could be drawn right now.
    pub fn available_numbers(&self) -> usize {
        self.issued.len()
    }
}
