//! # Domain Invariants
//!
//! Set rules the Context must uphold after every mutation.

use shared_types::TransactionNumber;
use std::collections::BTreeSet;

/// Invariant: no number is ever both issued and tentative.
pub fn invariant_pools_disjoint(
    issued: &BTreeSet<TransactionNumber>,
    tentative: &BTreeSet<TransactionNumber>,
) -> bool {
    issued.is_disjoint(tentative)
}

/// Split server-reported numbers around the current `highest`.
///
/// Returns `(good, bad)` where `good = {x > highest}` and `bad = {x <= highest}`.
pub fn partition_reported(
    reported: &BTreeSet<TransactionNumber>,
    highest: TransactionNumber,
) -> (BTreeSet<TransactionNumber>, BTreeSet<TransactionNumber>) {
    // BTreeSet::split_off keeps keys >= at, so split just above highest.
    let mut bad = reported.clone();
    let good = match highest.checked_add(1) {
        Some(at) => bad.split_off(&at),
        None => BTreeSet::new(),
    };
    (good, bad)
}

/// The highest value after accepting `good`.
pub fn raised_highest(
    highest: TransactionNumber,
    good: &BTreeSet<TransactionNumber>,
) -> TransactionNumber {
    good.last().copied().map_or(highest, |top| top.max(highest))
}

/// `base ∪ adding ∖ without`, in canonical (ascending) order.
pub fn canonical_set(
    base: &BTreeSet<TransactionNumber>,
    adding: &BTreeSet<TransactionNumber>,
    without: &BTreeSet<TransactionNumber>,
) -> BTreeSet<TransactionNumber> {
    base.union(adding)
        .filter(|n| !without.contains(n))
        .copied()
        .collect()
}
