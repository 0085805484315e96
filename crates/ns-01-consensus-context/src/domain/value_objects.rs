//! # Value Objects
//!
//! Results returned by Context operations.

use shared_types::TransactionNumber;
use std::collections::BTreeSet;

/// Outcome of [`Context::update_highest`](crate::Context::update_highest).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HighestUpdate {
    /// Fresh numbers folded into `issued`.
    pub good: BTreeSet<TransactionNumber>,
    /// Stale or replayed numbers that were dropped.
    pub bad: BTreeSet<TransactionNumber>,
    /// Good numbers that were already issued or checked out. Non-empty means
    /// the relationship was marked unusable.
    pub conflicts: BTreeSet<TransactionNumber>,
    /// `highest` after the call.
    pub highest: TransactionNumber,
}

impl HighestUpdate {
    /// True when no duplicate issuance was detected.
    pub fn is_consistent(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Outcome of [`Context::process_reply`](crate::Context::process_reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplySync {
    /// The echoed request number was outside tolerance.
    pub stale_request: bool,
    /// Remote nymbox hash now differs from the local one.
    pub nymbox_changed: bool,
}
