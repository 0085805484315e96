//! # Balance Statements
//!
//! A `Statement` is the canonical snapshot of the transaction numbers one
//! party believes are still issued to a nym. Both sides sign it so that a
//! transaction is only finalized when client and notary agree.
//!
//! Statements are immutable once built. The issuing set is a `BTreeSet`, so
//! iteration order (and therefore the signing preimage) is canonical.

use crate::entities::{NotaryId, NymId, Signature, TransactionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current statement format version.
pub const STATEMENT_VERSION: u32 = 1;

/// Domain separator prefixed to every statement preimage.
const STATEMENT_DOMAIN: &[u8; 8] = b"NSSTMT\x00\x01";

/// Immutable, signable set of issued transaction numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    version: u32,
    nym: NymId,
    notary: NotaryId,
    issuing_set: BTreeSet<TransactionNumber>,
}

impl Statement {
    /// Build a statement at the current format version.
    pub fn new(nym: NymId, notary: NotaryId, issuing_set: BTreeSet<TransactionNumber>) -> Self {
        Self {
            version: STATEMENT_VERSION,
            nym,
            notary,
            issuing_set,
        }
    }

    /// Format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Nym the statement speaks for.
    pub fn nym(&self) -> &NymId {
        &self.nym
    }

    /// Notary the numbers were issued by.
    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    /// The sorted issuing set.
    pub fn issuing_set(&self) -> &BTreeSet<TransactionNumber> {
        &self.issuing_set
    }

    /// Whether `number` is listed.
    pub fn contains(&self, number: TransactionNumber) -> bool {
        self.issuing_set.contains(&number)
    }

    /// Canonical bytes handed to the signer.
    ///
    /// Format: \[DOMAIN\]\[VERSION\]\[NYM_LEN\]\[NYM\]\[NOTARY_LEN\]\[NOTARY\]\[COUNT\]\[N1\]\[N2\]...
    /// with all integers little-endian and numbers in ascending order.
    pub fn preimage(&self) -> Vec<u8> {
        let nym = self.nym.as_str().as_bytes();
        let notary = self.notary.as_str().as_bytes();
        let mut buf =
            Vec::with_capacity(32 + nym.len() + notary.len() + self.issuing_set.len() * 8);

        buf.extend_from_slice(STATEMENT_DOMAIN);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(nym.len() as u64).to_le_bytes());
        buf.extend_from_slice(nym);
        buf.extend_from_slice(&(notary.len() as u64).to_le_bytes());
        buf.extend_from_slice(notary);
        buf.extend_from_slice(&(self.issuing_set.len() as u64).to_le_bytes());
        for number in &self.issuing_set {
            buf.extend_from_slice(&number.to_le_bytes());
        }

        buf
    }
}

/// A statement together with its signer's signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedStatement {
    /// The signed statement.
    pub statement: Statement,
    /// Signature over `statement.preimage()`.
    pub signature: Signature,
}
