//! # Managed Transaction Numbers
//!
//! A `ManagedNumber` is a scoped checkout of one transaction number. It must
//! end in exactly one outcome:
//!
//! ```text
//! [Acquired] ──commit(true)──→ [Consumed]   (number gone for good)
//!      │
//!      ├──── commit(false) ──→ [Returned]   (back in the issued pool)
//!      │
//!      └──── dropped ────────→ [Returned]   (logged as misuse)
//! ```
//!
//! `commit` takes `self` by value, so a second commit cannot be written. The
//! wrapper only sees its pool through the narrow [`NumberPool`] capability.

use shared_types::TransactionNumber;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a `ManagedNumber` may do to the pool it was drawn from.
pub trait NumberPool: Send + Sync {
    /// Put a checked-out number back into the spendable pool.
    ///
    /// Returns false if the number was no longer checked out.
    fn return_number(&self, number: TransactionNumber) -> bool;

    /// Record a checked-out number as permanently consumed.
    ///
    /// Returns false if the number was no longer checked out.
    fn mark_used(&self, number: TransactionNumber) -> bool;
}

/// Exclusive checkout of one transaction number.
///
/// ```
/// # use ns_01_consensus_context::{Context, Ed25519Signer, InMemoryContextStore};
/// # use shared_types::{NotaryId, NymId, RelationshipId};
/// # use std::sync::Arc;
/// # let context = Context::new(
/// #     RelationshipId::new(NymId::new("alice"), NotaryId::new("notary")),
/// #     Arc::new(Ed25519Signer::from_seed([1u8; 32])),
/// #     Arc::new(InMemoryContextStore::new()),
/// # );
/// # context.accept_issued_number(5);
/// let number = context.next_transaction_number("transfer").unwrap();
/// assert_eq!(number.number(), 5);
/// assert!(context.is_checked_out(5));
/// number.commit(false);
/// assert!(context.issued().contains(&5));
/// ```
///
/// A number settles once:
///
/// ```compile_fail
/// # use ns_01_consensus_context::{Context, Ed25519Signer, InMemoryContextStore};
/// # use shared_types::{NotaryId, NymId, RelationshipId};
/// # use std::sync::Arc;
/// # let context = Context::new(
/// #     RelationshipId::new(NymId::new("alice"), NotaryId::new("notary")),
/// #     Arc::new(Ed25519Signer::from_seed([1u8; 32])),
/// #     Arc::new(InMemoryContextStore::new()),
/// # );
/// # context.accept_issued_number(5);
/// let number = context.next_transaction_number("transfer").unwrap();
/// number.commit(true);
/// number.commit(false);
/// ```
///
/// and cannot be duplicated:
///
/// ```compile_fail
/// # use ns_01_consensus_context::{Context, Ed25519Signer, InMemoryContextStore};
/// # use shared_types::{NotaryId, NymId, RelationshipId};
/// # use std::sync::Arc;
/// # let context = Context::new(
/// #     RelationshipId::new(NymId::new("alice"), NotaryId::new("notary")),
/// #     Arc::new(Ed25519Signer::from_seed([1u8; 32])),
/// #     Arc::new(InMemoryContextStore::new()),
/// # );
/// # context.accept_issued_number(5);
/// let number = context.next_transaction_number("transfer").unwrap();
/// let copy = number.clone();
/// ```
pub struct ManagedNumber {
    number: TransactionNumber,
    reason: String,
    pool: Arc<dyn NumberPool>,
    settled: bool,
}

impl ManagedNumber {
    pub(crate) fn new(number: TransactionNumber, reason: String, pool: Arc<dyn NumberPool>) -> Self {
        Self {
            number,
            reason,
            pool,
            settled: false,
        }
    }

    /// The checked-out value.
    pub fn number(&self) -> TransactionNumber {
        self.number
    }

    /// Why it was drawn.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Settle the checkout.
    ///
    /// `true` consumes the number; `false` returns it to the pool. Returns
    /// whether the pool still knew the number.
    pub fn commit(mut self, success: bool) -> bool {
        self.settled = true;
        debug!(
            "[ns-01] Committing number {} ({}) success={}",
            self.number, self.reason, success
        );
        if success {
            self.pool.mark_used(self.number)
        } else {
            self.pool.return_number(self.number)
        }
    }
}

impl Drop for ManagedNumber {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "[ns-01] Number {} ({}) dropped without commit, returning to pool",
                self.number, self.reason
            );
            self.pool.return_number(self.number);
        }
    }
}

impl fmt::Debug for ManagedNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedNumber")
            .field("number", &self.number)
            .field("reason", &self.reason)
            .field("settled", &self.settled)
            .finish()
    }
}
