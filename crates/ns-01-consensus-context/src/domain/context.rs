//! # Consensus Context
//!
//! The persistent record of one (nym, notary) relationship.
//!
//! ## Number Pools
//!
//! ```text
//!            update_highest / accept_issued
//! tentative ───────────────────────────────→ issued
//!                                              │  next_transaction_number
//!                                              ▼
//!                                          checked_out ──commit(true)──→ (consumed)
//!                                              │
//!                                              └──commit(false)──→ issued
//! ```
//!
//! The three pools are pairwise disjoint. Statements are built over
//! `issued ∪ checked_out`, which is everything not yet consumed.
//!
//! Every mutation happens under one exclusive lock, bumps `revision` and is
//! written through the [`ContextStore`]. A failed write leaves the context
//! dirty until [`Context::flush`] succeeds.

use crate::domain::errors::ContextError;
use crate::domain::invariants::{
    canonical_set, invariant_pools_disjoint, partition_reported, raised_highest,
};
use crate::domain::managed_number::{ManagedNumber, NumberPool};
use crate::domain::serialized::{ContextSnapshot, SerializedContext, CONTEXT_VERSION};
use crate::domain::value_objects::{HighestUpdate, ReplySync};
use crate::ports::{ContextStore, Signer};
use parking_lot::Mutex;
use shared_types::{
    Command, CommandPayload, NymboxHash, RelationshipId, Reply, RequestNumber, ServerView,
    SignedStatement, Statement, TransactionNumber,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct ContextState {
    revision: u64,
    request_number: RequestNumber,
    highest: TransactionNumber,
    issued: BTreeSet<TransactionNumber>,
    tentative: BTreeSet<TransactionNumber>,
    checked_out: BTreeSet<TransactionNumber>,
    acknowledged: BTreeSet<RequestNumber>,
    local_nymbox_hash: NymboxHash,
    remote_nymbox_hash: NymboxHash,
    admin_password: Option<String>,
    admin_attempted: bool,
    admin_success: bool,
    stale: bool,
    unusable: bool,
    dirty: bool,
}

impl ContextState {
    fn from_serialized(serialized: &SerializedContext) -> Self {
        Self {
            revision: serialized.revision,
            request_number: serialized.request_number,
            highest: serialized.highest,
            issued: serialized.issued.clone(),
            tentative: serialized.tentative.clone(),
            checked_out: serialized.checked_out.clone(),
            acknowledged: serialized.acknowledged.clone(),
            local_nymbox_hash: serialized.local_nymbox_hash,
            remote_nymbox_hash: serialized.remote_nymbox_hash,
            admin_password: None,
            admin_attempted: false,
            admin_success: false,
            stale: false,
            unusable: false,
            dirty: false,
        }
    }

    fn to_serialized(&self, relationship: &RelationshipId) -> SerializedContext {
        SerializedContext {
            version: CONTEXT_VERSION,
            relationship: relationship.clone(),
            revision: self.revision,
            request_number: self.request_number,
            highest: self.highest,
            issued: self.issued.clone(),
            tentative: self.tentative.clone(),
            checked_out: self.checked_out.clone(),
            acknowledged: self.acknowledged.clone(),
            local_nymbox_hash: self.local_nymbox_hash,
            remote_nymbox_hash: self.remote_nymbox_hash,
        }
    }

    /// Numbers issued to us and not yet consumed.
    fn unspent(&self) -> BTreeSet<TransactionNumber> {
        self.issued.union(&self.checked_out).copied().collect()
    }

    fn holds(&self, number: TransactionNumber) -> bool {
        self.issued.contains(&number) || self.checked_out.contains(&number)
    }

    fn next_request_number(&mut self) -> RequestNumber {
        self.request_number += 1;
        self.request_number
    }
}

/// Consensus record for one (nym, notary) relationship.
pub struct Context {
    relationship: RelationshipId,
    signer: Arc<dyn Signer>,
    store: Arc<dyn ContextStore>,
    state: Mutex<ContextState>,
}

impl Context {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// Fresh context for a relationship that has never been seen.
    pub fn new(
        relationship: RelationshipId,
        signer: Arc<dyn Signer>,
        store: Arc<dyn ContextStore>,
    ) -> Arc<Self> {
        let state = ContextState::from_serialized(&SerializedContext::empty(relationship.clone()));
        let context = Arc::new(Self {
            relationship,
            signer,
            store,
            state: Mutex::new(state),
        });
        {
            let mut state = context.state.lock();
            context.persist(&mut state);
        }
        info!("[ns-01] Created context for {}", context.relationship);
        context
    }

    /// Load the stored context for `relationship`, or create one.
    pub fn load(
        relationship: RelationshipId,
        signer: Arc<dyn Signer>,
        store: Arc<dyn ContextStore>,
    ) -> Result<Arc<Self>, ContextError> {
        match store.load_context(&relationship) {
            Some(serialized) => {
                if serialized.relationship != relationship {
                    return Err(ContextError::IdentityMismatch {
                        expected: relationship,
                        found: serialized.relationship,
                    });
                }
                Self::from_serialized(serialized, signer, store)
            }
            None => Ok(Self::new(relationship, signer, store)),
        }
    }

    /// Rebuild a context from its persisted form.
    ///
    /// Numbers that were checked out when the form was written go back to
    /// `issued`: nothing proves they were consumed.
    pub fn from_serialized(
        serialized: SerializedContext,
        signer: Arc<dyn Signer>,
        store: Arc<dyn ContextStore>,
    ) -> Result<Arc<Self>, ContextError> {
        if serialized.version != CONTEXT_VERSION {
            return Err(ContextError::UnsupportedVersion(serialized.version));
        }

        let mut state = ContextState::from_serialized(&serialized);
        let recovered = std::mem::take(&mut state.checked_out);
        let changed = !recovered.is_empty();
        if changed {
            info!(
                "[ns-01] {}: returning {} checked-out numbers to issued",
                serialized.relationship,
                recovered.len()
            );
        }
        state.issued.extend(recovered);
        let issued = state.issued.clone();
        state.tentative.retain(|n| !issued.contains(n));

        let context = Arc::new(Self {
            relationship: serialized.relationship,
            signer,
            store,
            state: Mutex::new(state),
        });
        if changed {
            let mut state = context.state.lock();
            context.persist(&mut state);
        }
        debug!(
            "[ns-01] Loaded context for {} at revision {}",
            context.relationship,
            context.revision()
        );
        Ok(context)
    }

    /// Relationship this context belongs to.
    pub fn relationship(&self) -> &RelationshipId {
        &self.relationship
    }

    /// Bump the revision and write through. Caller holds the lock.
    fn persist(&self, state: &mut ContextState) -> bool {
        state.revision += 1;
        self.write_through(state)
    }

    fn write_through(&self, state: &mut ContextState) -> bool {
        let serialized = state.to_serialized(&self.relationship);
        if self.store.store_context(&serialized) {
            state.dirty = false;
            true
        } else {
            if !state.dirty {
                error!(
                    "[ns-01] {}: failed to persist revision {}",
                    self.relationship, state.revision
                );
            }
            state.dirty = true;
            false
        }
    }

    // =========================================================================
    // TRANSACTION NUMBERS
    // =========================================================================

    /// Check out the lowest spendable number.
    ///
    /// `None` when nothing is spendable or the relationship is unusable.
    pub fn next_transaction_number(self: &Arc<Self>, reason: &str) -> Option<ManagedNumber> {
        let number = {
            let mut state = self.state.lock();
            if state.unusable {
                warn!(
                    "[ns-01] {}: refusing number for '{}', context unusable",
                    self.relationship, reason
                );
                return None;
            }
            let Some(number) = state.issued.pop_first() else {
                debug!(
                    "[ns-01] {}: no spendable numbers for '{}'",
                    self.relationship, reason
                );
                return None;
            };
            state.checked_out.insert(number);
            self.persist(&mut state);
            number
        };

        debug!(
            "[ns-01] {}: checked out number {} for '{}'",
            self.relationship, number, reason
        );
        let pool: Arc<dyn NumberPool> = Arc::clone(self) as Arc<dyn NumberPool>;
        Some(ManagedNumber::new(number, reason.to_string(), pool))
    }

    /// Record a number requested from the notary but not yet confirmed.
    pub fn add_tentative_number(&self, number: TransactionNumber) -> bool {
        let mut state = self.state.lock();
        if state.holds(number) {
            warn!(
                "[ns-01] {}: {} is already issued, not tentative",
                self.relationship, number
            );
            return false;
        }
        if !state.tentative.insert(number) {
            return false;
        }
        self.persist(&mut state);
        true
    }

    /// Forget a tentative number.
    pub fn remove_tentative_number(&self, number: TransactionNumber) -> bool {
        let mut state = self.state.lock();
        if !state.tentative.remove(&number) {
            return false;
        }
        self.persist(&mut state);
        true
    }

    fn accept_into(state: &mut ContextState, relationship: &RelationshipId, number: TransactionNumber) -> bool {
        if state.holds(number) {
            error!(
                "[ns-01] {}: duplicate issuance of number {}",
                relationship, number
            );
            return false;
        }
        state.tentative.remove(&number);
        state.issued.insert(number);
        true
    }

    /// Move one confirmed number into `issued`. Fails on duplicate issuance.
    pub fn accept_issued_number(&self, number: TransactionNumber) -> bool {
        let mut state = self.state.lock();
        if !Self::accept_into(&mut state, &self.relationship, number) {
            return false;
        }
        self.persist(&mut state);
        true
    }

    /// Move every number in `statement` into `issued`, or none of them.
    pub fn accept_issued_numbers(&self, statement: &Statement) -> bool {
        if !self.is_own(statement) {
            error!(
                "[ns-01] {}: statement for {}@{} cannot issue numbers here",
                self.relationship,
                statement.nym(),
                statement.notary()
            );
            return false;
        }

        let mut state = self.state.lock();
        let duplicates: Vec<TransactionNumber> = statement
            .issuing_set()
            .iter()
            .copied()
            .filter(|n| state.holds(*n))
            .collect();
        if !duplicates.is_empty() {
            error!(
                "[ns-01] {}: duplicate issuance of {:?}",
                self.relationship, duplicates
            );
            return false;
        }
        if statement.issuing_set().is_empty() {
            return true;
        }

        for number in statement.issuing_set() {
            Self::accept_into(&mut state, &self.relationship, *number);
        }
        self.persist(&mut state);
        true
    }

    /// Fold server-reported numbers in, rejecting anything at or below
    /// `highest`. The only way `highest` advances.
    ///
    /// A good number already issued or checked out is duplicate issuance:
    /// the context is marked unusable and the pools are left untouched.
    pub fn update_highest(&self, reported: &BTreeSet<TransactionNumber>) -> HighestUpdate {
        let mut state = self.state.lock();
        let (good, bad) = partition_reported(reported, state.highest);

        if !bad.is_empty() {
            warn!(
                "[ns-01] {}: rejected {} stale numbers {:?} (highest {})",
                self.relationship,
                bad.len(),
                bad,
                state.highest
            );
        }

        let conflicts: BTreeSet<TransactionNumber> =
            good.iter().copied().filter(|n| state.holds(*n)).collect();
        let raised = raised_highest(state.highest, &good);

        if !conflicts.is_empty() {
            error!(
                "[ns-01] {}: numbers {:?} reported as new but already held, marking unusable",
                self.relationship, conflicts
            );
            state.highest = raised;
            state.unusable = true;
            self.persist(&mut state);
        } else if !good.is_empty() {
            for number in &good {
                state.tentative.remove(number);
                state.issued.insert(*number);
            }
            state.highest = raised;
            debug_assert!(invariant_pools_disjoint(&state.issued, &state.tentative));
            info!(
                "[ns-01] {}: accepted {} numbers, highest now {}",
                self.relationship,
                good.len(),
                state.highest
            );
            self.persist(&mut state);
        }

        HighestUpdate {
            good,
            bad,
            conflicts,
            highest: state.highest,
        }
    }

    /// Number currently checked out by a ManagedNumber.
    pub fn is_checked_out(&self, number: TransactionNumber) -> bool {
        self.state.lock().checked_out.contains(&number)
    }

    /// Spendable count.
    pub fn available_numbers(&self) -> usize {
        self.state.lock().issued.len()
    }

    /// Copy of the spendable pool.
    pub fn issued(&self) -> BTreeSet<TransactionNumber> {
        self.state.lock().issued.clone()
    }

    /// Copy of the tentative pool.
    pub fn tentative(&self) -> BTreeSet<TransactionNumber> {
        self.state.lock().tentative.clone()
    }

    /// Largest number ever accepted.
    pub fn highest(&self) -> TransactionNumber {
        self.state.lock().highest
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    fn is_own(&self, statement: &Statement) -> bool {
        statement.nym() == &self.relationship.nym && statement.notary() == &self.relationship.notary
    }

    /// Statement over `(issued ∪ checked_out) ∪ adding ∖ without`.
    pub fn build_statement(
        &self,
        adding: &BTreeSet<TransactionNumber>,
        without: &BTreeSet<TransactionNumber>,
    ) -> Statement {
        let base = self.state.lock().unspent();
        Statement::new(
            self.relationship.nym.clone(),
            self.relationship.notary.clone(),
            canonical_set(&base, adding, without),
        )
    }

    /// Sign `statement` with the local nym's key.
    pub fn sign_statement(&self, statement: Statement) -> Option<SignedStatement> {
        match self.signer.sign(&statement.preimage()) {
            Some(signature) => Some(SignedStatement {
                statement,
                signature,
            }),
            None => {
                error!("[ns-01] {}: failed to sign statement", self.relationship);
                None
            }
        }
    }

    /// True if `candidate` names this relationship and lists exactly the
    /// numbers not yet consumed.
    pub fn verify_statement(&self, candidate: &Statement) -> bool {
        if !self.is_own(candidate) {
            warn!(
                "[ns-01] {}: statement belongs to {}@{}",
                self.relationship,
                candidate.nym(),
                candidate.notary()
            );
            return false;
        }
        let expected = self.state.lock().unspent();
        if &expected != candidate.issuing_set() {
            warn!(
                "[ns-01] {}: statement mismatch, local {:?} vs {:?}",
                self.relationship,
                expected,
                candidate.issuing_set()
            );
            return false;
        }
        true
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Advance and return the outgoing request number.
    pub fn update_request_number(&self) -> RequestNumber {
        let mut state = self.state.lock();
        let number = state.next_request_number();
        self.persist(&mut state);
        number
    }

    /// Last request number handed out.
    pub fn request_number(&self) -> RequestNumber {
        self.state.lock().request_number
    }

    /// Build an unsigned command stamped with a fresh request number, the
    /// local nymbox hash and the outstanding acknowledgments.
    pub fn initialize_command(
        &self,
        payload: CommandPayload,
        transaction_number: Option<TransactionNumber>,
    ) -> Command {
        let mut state = self.state.lock();
        let request_number = state.next_request_number();
        let command = Command {
            nym: self.relationship.nym.clone(),
            notary: self.relationship.notary.clone(),
            request_number,
            nymbox_hash: state.local_nymbox_hash,
            acknowledged: state.acknowledged.clone(),
            transaction_number,
            statement: None,
            payload,
            signature: None,
        };
        self.persist(&mut state);
        command
    }

    /// Attach the nym's signature. False if encoding or signing failed.
    pub fn finalize_command(&self, command: &mut Command) -> bool {
        let preimage = match command.preimage() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "[ns-01] {}: cannot encode {:?} command: {}",
                    self.relationship,
                    command.kind(),
                    e
                );
                return false;
            }
        };
        match self.signer.sign(&preimage) {
            Some(signature) => {
                command.signature = Some(signature);
                true
            }
            None => {
                error!(
                    "[ns-01] {}: signer refused {:?} command #{}",
                    self.relationship,
                    command.kind(),
                    command.request_number
                );
                false
            }
        }
    }

    /// Apply the bookkeeping carried by every reply.
    ///
    /// Prunes acknowledgments the notary has recorded, acknowledges `sent`,
    /// adopts the remote nymbox hash and marks the context stale if the echoed
    /// request number drifts from `sent` by more than `tolerance`.
    pub fn process_reply(&self, reply: &Reply, sent: RequestNumber, tolerance: u64) -> ReplySync {
        let mut state = self.state.lock();
        for ack in &reply.acknowledged {
            state.acknowledged.remove(ack);
        }
        state.acknowledged.insert(sent);
        state.remote_nymbox_hash = reply.nymbox_hash;

        let stale_request = reply.request_number.abs_diff(sent) > tolerance;
        if stale_request {
            warn!(
                "[ns-01] {}: request number drift, sent {} notary echoed {}",
                self.relationship, sent, reply.request_number
            );
            state.stale = true;
        }
        let nymbox_changed = state.remote_nymbox_hash != state.local_nymbox_hash;
        self.persist(&mut state);

        ReplySync {
            stale_request,
            nymbox_changed,
        }
    }

    // =========================================================================
    // RESYNCHRONIZATION
    // =========================================================================

    /// Replace state from an authoritative snapshot.
    ///
    /// Checked-out numbers the snapshot still lists stay checked out; the rest
    /// are void. `highest` never decreases. Clears the stale flag.
    pub fn resync(&self, serialized: &SerializedContext) -> bool {
        if serialized.relationship != self.relationship {
            error!(
                "[ns-01] {}: refusing resync from {}",
                self.relationship, serialized.relationship
            );
            return false;
        }
        if serialized.version != CONTEXT_VERSION {
            error!(
                "[ns-01] {}: refusing resync from version {}",
                self.relationship, serialized.version
            );
            return false;
        }

        let mut state = self.state.lock();
        let authoritative: BTreeSet<TransactionNumber> = serialized
            .issued
            .union(&serialized.checked_out)
            .copied()
            .collect();
        let (kept, voided): (BTreeSet<_>, BTreeSet<_>) = state
            .checked_out
            .iter()
            .copied()
            .partition(|n| authoritative.contains(n));
        if !voided.is_empty() {
            warn!(
                "[ns-01] {}: resync voided checked-out numbers {:?}",
                self.relationship, voided
            );
        }

        state.issued = authoritative.difference(&kept).copied().collect();
        state.checked_out = kept;
        state.tentative = serialized.tentative.difference(&authoritative).copied().collect();
        state.highest = state.highest.max(serialized.highest);
        state.request_number = serialized.request_number;
        state.acknowledged = serialized.acknowledged.clone();
        state.local_nymbox_hash = serialized.local_nymbox_hash;
        state.remote_nymbox_hash = serialized.remote_nymbox_hash;
        state.revision = state.revision.max(serialized.revision);
        state.stale = false;
        self.persist(&mut state);

        info!(
            "[ns-01] {}: resynchronized, {} issued, request number {}",
            self.relationship,
            state.issued.len(),
            state.request_number
        );
        true
    }

    /// Resync from the notary's view of this relationship, keeping local
    /// tentative numbers, acknowledgments and local nymbox hash.
    pub fn apply_server_view(&self, view: &ServerView) -> bool {
        let serialized = {
            let state = self.state.lock();
            SerializedContext {
                version: CONTEXT_VERSION,
                relationship: self.relationship.clone(),
                revision: state.revision,
                request_number: view.request_number,
                highest: view.highest,
                issued: view.issued.clone(),
                tentative: state.tentative.clone(),
                checked_out: BTreeSet::new(),
                acknowledged: state.acknowledged.clone(),
                local_nymbox_hash: state.local_nymbox_hash,
                remote_nymbox_hash: view.nymbox_hash,
            }
        };
        self.resync(&serialized)
    }

    /// Needs a resync before normal work continues.
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// Force a resync before the next dispatch.
    pub fn mark_stale(&self) {
        let mut state = self.state.lock();
        if !state.stale {
            warn!("[ns-01] {}: marked stale", self.relationship);
            state.stale = true;
            self.persist(&mut state);
        }
    }

    /// Unrecoverable: an invariant was violated.
    pub fn is_unusable(&self) -> bool {
        self.state.lock().unusable
    }

    /// Stop handing out numbers for good.
    pub fn mark_unusable(&self, reason: &str) {
        let mut state = self.state.lock();
        if !state.unusable {
            error!("[ns-01] {}: unusable: {}", self.relationship, reason);
            state.unusable = true;
            self.persist(&mut state);
        }
    }

    // =========================================================================
    // NYMBOX
    // =========================================================================

    pub fn local_nymbox_hash(&self) -> NymboxHash {
        self.state.lock().local_nymbox_hash
    }

    pub fn remote_nymbox_hash(&self) -> NymboxHash {
        self.state.lock().remote_nymbox_hash
    }

    pub fn set_local_nymbox_hash(&self, hash: NymboxHash) -> bool {
        let mut state = self.state.lock();
        if state.local_nymbox_hash == hash {
            return false;
        }
        state.local_nymbox_hash = hash;
        self.persist(&mut state);
        true
    }

    pub fn set_remote_nymbox_hash(&self, hash: NymboxHash) -> bool {
        let mut state = self.state.lock();
        if state.remote_nymbox_hash == hash {
            return false;
        }
        state.remote_nymbox_hash = hash;
        self.persist(&mut state);
        true
    }

    /// Local and remote hashes agree.
    pub fn nymbox_hash_match(&self) -> bool {
        let state = self.state.lock();
        state.local_nymbox_hash == state.remote_nymbox_hash
    }

    // =========================================================================
    // ACKNOWLEDGMENTS
    // =========================================================================

    pub fn acknowledged_requests(&self) -> BTreeSet<RequestNumber> {
        self.state.lock().acknowledged.clone()
    }

    pub fn add_acknowledged_request(&self, number: RequestNumber) -> bool {
        let mut state = self.state.lock();
        if !state.acknowledged.insert(number) {
            return false;
        }
        self.persist(&mut state);
        true
    }

    pub fn remove_acknowledged_requests(&self, numbers: &BTreeSet<RequestNumber>) -> bool {
        let mut state = self.state.lock();
        let before = state.acknowledged.len();
        state.acknowledged.retain(|n| !numbers.contains(n));
        if state.acknowledged.len() == before {
            return false;
        }
        self.persist(&mut state);
        true
    }

    // =========================================================================
    // ADMIN SESSION
    // =========================================================================

    pub fn set_admin_password(&self, password: Option<String>) {
        let mut state = self.state.lock();
        state.admin_password = password;
        state.admin_attempted = false;
        state.admin_success = false;
        self.persist(&mut state);
    }

    pub fn admin_password(&self) -> Option<String> {
        self.state.lock().admin_password.clone()
    }

    pub fn set_admin_attempted(&self) {
        let mut state = self.state.lock();
        if !state.admin_attempted {
            state.admin_attempted = true;
            self.persist(&mut state);
        }
    }

    pub fn admin_attempted(&self) -> bool {
        self.state.lock().admin_attempted
    }

    pub fn set_admin_success(&self) {
        let mut state = self.state.lock();
        if !state.admin_success {
            state.admin_success = true;
            self.persist(&mut state);
        }
    }

    pub fn is_admin(&self) -> bool {
        self.state.lock().admin_success
    }

    // =========================================================================
    // PERSISTENCE AND INSPECTION
    // =========================================================================

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Last write-through failed and has not been retried successfully.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Retry a failed write-through. True if nothing is left unwritten.
    pub fn flush(&self) -> bool {
        let mut state = self.state.lock();
        if !state.dirty {
            return true;
        }
        let written = self.write_through(&mut state);
        if written {
            info!(
                "[ns-01] {}: flushed revision {}",
                self.relationship, state.revision
            );
        }
        written
    }

    /// Current persisted form.
    pub fn serialize(&self) -> SerializedContext {
        self.state.lock().to_serialized(&self.relationship)
    }

    /// Read-only view taken under the context lock.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock();
        ContextSnapshot {
            relationship: self.relationship.clone(),
            revision: state.revision,
            request_number: state.request_number,
            highest: state.highest,
            issued: state.issued.clone(),
            tentative: state.tentative.clone(),
            checked_out: state.checked_out.clone(),
            acknowledged: state.acknowledged.clone(),
            nymbox_in_sync: state.local_nymbox_hash == state.remote_nymbox_hash,
            stale: state.stale,
            unusable: state.unusable,
            admin: state.admin_success,
        }
    }
}

impl NumberPool for Context {
    fn return_number(&self, number: TransactionNumber) -> bool {
        let mut state = self.state.lock();
        if !state.checked_out.remove(&number) {
            warn!(
                "[ns-01] {}: cannot return {}, no longer checked out",
                self.relationship, number
            );
            return false;
        }
        state.issued.insert(number);
        self.persist(&mut state);
        true
    }

    fn mark_used(&self, number: TransactionNumber) -> bool {
        let mut state = self.state.lock();
        if !state.checked_out.remove(&number) {
            warn!(
                "[ns-01] {}: cannot consume {}, no longer checked out",
                self.relationship, number
            );
            return false;
        }
        self.persist(&mut state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Ed25519Signer, InMemoryContextStore};
    use crate::ports::Verifier;
    use proptest::prelude::*;
    use shared_types::{CommandKind, NotaryId, NymId, ReplyPayload, ReplyStatus};

    fn relationship() -> RelationshipId {
        RelationshipId::new(NymId::new("alice"), NotaryId::new("notary"))
    }

    fn setup() -> (Arc<Context>, Arc<InMemoryContextStore>, Arc<Ed25519Signer>) {
        let store = Arc::new(InMemoryContextStore::new());
        let signer = Arc::new(Ed25519Signer::from_seed([7u8; 32]));
        let context = Context::new(relationship(), signer.clone(), store.clone());
        (context, store, signer)
    }

    fn set(values: &[TransactionNumber]) -> BTreeSet<TransactionNumber> {
        values.iter().copied().collect()
    }

    fn reply(echo: RequestNumber, acks: &[RequestNumber], hash: NymboxHash) -> Reply {
        Reply {
            kind: CommandKind::DownloadNymbox,
            request_number: echo,
            status: ReplyStatus::Accepted,
            nymbox_hash: hash,
            acknowledged: acks.iter().copied().collect(),
            payload: ReplyPayload::None,
            statement: None,
        }
    }

    #[test]
    fn test_empty_context_has_no_numbers() {
        let (context, _, _) = setup();
        assert!(context.next_transaction_number("transfer").is_none());
        assert_eq!(context.highest(), 0);
    }

    #[test]
    fn test_update_highest_accepts_fresh_numbers() {
        let (context, _, _) = setup();
        let update = context.update_highest(&set(&[5, 6, 7]));
        assert_eq!(update.good, set(&[5, 6, 7]));
        assert!(update.bad.is_empty());
        assert_eq!(update.highest, 7);
        assert_eq!(context.issued(), set(&[5, 6, 7]));

        let number = context.next_transaction_number("transfer").unwrap();
        assert_eq!(number.number(), 5);
        number.commit(false);
    }

    #[test]
    fn test_update_highest_rejects_replay_without_mutation() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[5, 6, 7]));
        let revision = context.revision();

        let update = context.update_highest(&set(&[5, 6, 7]));
        assert!(update.good.is_empty());
        assert_eq!(update.bad, set(&[5, 6, 7]));
        assert_eq!(update.highest, 7);
        assert_eq!(context.revision(), revision);
        assert_eq!(context.issued(), set(&[5, 6, 7]));
    }

    #[test]
    fn test_update_highest_moves_tentative_into_issued() {
        let (context, _, _) = setup();
        assert!(context.add_tentative_number(9));
        context.update_highest(&set(&[8, 9]));
        assert!(context.tentative().is_empty());
        assert_eq!(context.issued(), set(&[8, 9]));
    }

    #[test]
    fn test_update_highest_conflict_marks_unusable() {
        let (context, _, _) = setup();
        assert!(context.accept_issued_number(100));
        let update = context.update_highest(&set(&[100, 101]));
        assert_eq!(update.conflicts, set(&[100]));
        assert!(!update.is_consistent());
        assert!(context.is_unusable());
        assert!(context.next_transaction_number("after conflict").is_none());
    }

    #[test]
    fn test_tentative_and_issued_stay_disjoint() {
        let (context, _, _) = setup();
        assert!(context.add_tentative_number(3));
        assert!(!context.add_tentative_number(3));
        assert!(context.accept_issued_number(3));
        assert!(context.tentative().is_empty());
        assert!(!context.add_tentative_number(3));
        assert!(!context.accept_issued_number(3));
        assert!(!context.remove_tentative_number(3));
    }

    #[test]
    fn test_accept_issued_numbers_is_all_or_nothing() {
        let (context, _, _) = setup();
        context.accept_issued_number(2);
        let statement = Statement::new(
            relationship().nym,
            relationship().notary,
            set(&[1, 2, 3]),
        );
        assert!(!context.accept_issued_numbers(&statement));
        assert_eq!(context.issued(), set(&[2]));

        let fresh = Statement::new(relationship().nym, relationship().notary, set(&[1, 3]));
        assert!(context.accept_issued_numbers(&fresh));
        assert_eq!(context.issued(), set(&[1, 2, 3]));
    }

    #[test]
    fn test_accept_issued_numbers_rejects_foreign_statement() {
        let (context, _, _) = setup();
        let foreign = Statement::new(NymId::new("bob"), NotaryId::new("notary"), set(&[1]));
        assert!(!context.accept_issued_numbers(&foreign));
    }

    #[test]
    fn test_managed_number_commit_success_consumes() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[5, 6]));
        let number = context.next_transaction_number("transfer").unwrap();
        assert!(context.is_checked_out(5));
        assert!(number.commit(true));
        assert!(!context.is_checked_out(5));

        let next = context.next_transaction_number("transfer").unwrap();
        assert_eq!(next.number(), 6);
        next.commit(true);
        assert!(context.next_transaction_number("transfer").is_none());
    }

    #[test]
    fn test_managed_number_drop_returns_to_issued() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[5]));
        {
            let number = context.next_transaction_number("abandoned").unwrap();
            assert_eq!(context.available_numbers(), 0);
            assert_eq!(number.number(), 5);
        }
        assert_eq!(context.issued(), set(&[5]));
    }

    #[test]
    fn test_statement_covers_checked_out_numbers() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[5, 6, 7]));
        let number = context.next_transaction_number("transfer").unwrap();

        let statement = context.build_statement(&BTreeSet::new(), &set(&[number.number()]));
        assert_eq!(statement.issuing_set(), &set(&[6, 7]));
        assert!(context.verify_statement(&context.build_statement(&BTreeSet::new(), &BTreeSet::new())));
        assert!(!context.verify_statement(&statement));

        number.commit(true);
        assert!(context.verify_statement(&statement));
    }

    #[test]
    fn test_sign_statement_verifies() {
        let (context, _, signer) = setup();
        context.update_highest(&set(&[1, 2]));
        let statement = context.build_statement(&BTreeSet::new(), &BTreeSet::new());
        let signed = context.sign_statement(statement).unwrap();
        assert!(signer.verify(&signed.statement.preimage(), &signed.signature));
    }

    #[test]
    fn test_initialize_and_finalize_command() {
        let (context, _, signer) = setup();
        context.add_acknowledged_request(4);
        let mut command = context.initialize_command(CommandPayload::DownloadNymbox, None);
        assert_eq!(command.request_number, 1);
        assert_eq!(command.acknowledged, [4].into_iter().collect());
        assert!(command.signature.is_none());

        assert!(context.finalize_command(&mut command));
        let signature = command.signature.unwrap();
        assert!(signer.verify(&command.preimage().unwrap(), &signature));

        assert_eq!(context.update_request_number(), 2);
        assert_eq!(context.initialize_command(CommandPayload::RegisterNym, None).request_number, 3);
    }

    #[test]
    fn test_finalize_command_reports_signer_failure() {
        struct Refusing;
        impl Signer for Refusing {
            fn sign(&self, _: &[u8]) -> Option<shared_types::Signature> {
                None
            }
        }
        let context = Context::new(
            relationship(),
            Arc::new(Refusing),
            Arc::new(InMemoryContextStore::new()),
        );
        let mut command = context.initialize_command(CommandPayload::RegisterNym, None);
        assert!(!context.finalize_command(&mut command));
        assert!(command.signature.is_none());
        assert!(context.sign_statement(context.build_statement(&BTreeSet::new(), &BTreeSet::new())).is_none());
    }

    #[test]
    fn test_process_reply_prunes_and_acknowledges() {
        let (context, _, _) = setup();
        context.add_acknowledged_request(1);
        context.add_acknowledged_request(2);
        let hash = NymboxHash::of(b"box");

        let sync = context.process_reply(&reply(3, &[1], hash), 3, 1);
        assert!(!sync.stale_request);
        assert!(sync.nymbox_changed);
        assert_eq!(context.acknowledged_requests(), [2, 3].into_iter().collect());
        assert_eq!(context.remote_nymbox_hash(), hash);
        assert!(!context.nymbox_hash_match());
    }

    #[test]
    fn test_process_reply_marks_stale_beyond_tolerance() {
        let (context, _, _) = setup();
        assert!(!context.process_reply(&reply(4, &[], NymboxHash::default()), 3, 1).stale_request);
        assert!(!context.is_stale());
        assert!(context.process_reply(&reply(9, &[], NymboxHash::default()), 3, 1).stale_request);
        assert!(context.is_stale());
    }

    #[test]
    fn test_resync_voids_unlisted_checked_out_numbers() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[5, 6, 7]));
        let kept = context.next_transaction_number("kept").unwrap();
        let voided = context.next_transaction_number("voided").unwrap();
        context.mark_stale();

        let view = ServerView {
            request_number: 40,
            nymbox_hash: NymboxHash::of(b"server"),
            issued: set(&[5, 7, 9]),
            highest: 9,
        };
        assert!(context.apply_server_view(&view));
        assert!(!context.is_stale());
        assert_eq!(context.request_number(), 40);
        assert_eq!(context.highest(), 9);
        assert_eq!(context.issued(), set(&[7, 9]));
        assert!(context.is_checked_out(kept.number()));
        assert!(!context.is_checked_out(voided.number()));

        // Committing a voided number is a logged no-op.
        assert!(!voided.commit(false));
        assert!(!context.issued().contains(&6));
        assert!(kept.commit(true));
    }

    #[test]
    fn test_resync_never_lowers_highest() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[50]));
        let mut serialized = context.serialize();
        serialized.highest = 10;
        serialized.issued = set(&[3]);
        let revision = context.revision();
        assert!(context.resync(&serialized));
        assert_eq!(context.highest(), 50);
        assert!(context.revision() > revision);
    }

    #[test]
    fn test_resync_rejects_foreign_snapshot() {
        let (context, _, _) = setup();
        let foreign = SerializedContext::empty(RelationshipId::new(
            NymId::new("mallory"),
            NotaryId::new("notary"),
        ));
        assert!(!context.resync(&foreign));
    }

    #[test]
    fn test_every_mutation_bumps_revision_and_persists() {
        let (context, store, _) = setup();
        let start = context.revision();
        context.add_tentative_number(11);
        context.set_local_nymbox_hash(NymboxHash::of(b"x"));
        context.update_request_number();
        assert_eq!(context.revision(), start + 3);
        assert_eq!(store.load_context(&relationship()).unwrap().revision, start + 3);
    }

    #[test]
    fn test_persist_failure_sets_dirty_until_flush() {
        let (context, store, _) = setup();
        store.set_fail_writes(true);
        context.add_tentative_number(1);
        assert!(context.is_dirty());
        assert!(!context.flush());

        store.set_fail_writes(false);
        assert!(context.flush());
        assert!(!context.is_dirty());
        assert_eq!(store.load_context(&relationship()).unwrap().tentative, set(&[1]));
    }

    #[test]
    fn test_load_returns_checked_out_to_issued() {
        let (context, store, signer) = setup();
        context.update_highest(&set(&[5, 6]));
        let held = context.next_transaction_number("crash").unwrap();
        std::mem::forget(held);

        let reloaded = Context::load(relationship(), signer, store).unwrap();
        assert_eq!(reloaded.issued(), set(&[5, 6]));
        assert!(!reloaded.is_checked_out(5));
        assert_eq!(reloaded.highest(), 6);
    }

    #[test]
    fn test_from_serialized_rejects_unknown_version() {
        let (_, store, signer) = setup();
        let mut serialized = SerializedContext::empty(relationship());
        serialized.version = 99;
        let result = Context::from_serialized(serialized, signer, store);
        assert!(matches!(result, Err(ContextError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_admin_session_state() {
        let (context, _, _) = setup();
        assert!(context.admin_password().is_none());
        context.set_admin_password(Some("secret".into()));
        assert_eq!(context.admin_password().as_deref(), Some("secret"));
        assert!(!context.admin_attempted());
        context.set_admin_attempted();
        context.set_admin_success();
        assert!(context.admin_attempted());
        assert!(context.is_admin());
        assert!(context.snapshot().admin);
        assert!(context.serialize().issued.is_empty());
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let (context, _, _) = setup();
        context.update_highest(&set(&[1, 2, 3]));
        let held = context.next_transaction_number("snap").unwrap();
        let snapshot = context.snapshot();
        assert_eq!(snapshot.available_numbers(), 2);
        assert_eq!(snapshot.checked_out, set(&[1]));
        assert!(snapshot.nymbox_in_sync);
        held.commit(false);
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        Add(TransactionNumber),
        Remove(TransactionNumber),
        Accept(TransactionNumber),
        Highest(Vec<TransactionNumber>),
    }

    fn pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            (0i64..30).prop_map(PoolOp::Add),
            (0i64..30).prop_map(PoolOp::Remove),
            (0i64..30).prop_map(PoolOp::Accept),
            prop::collection::vec(0i64..30, 0..5).prop_map(PoolOp::Highest),
        ]
    }

    proptest! {
        #[test]
        fn prop_issued_and_tentative_disjoint(ops in prop::collection::vec(pool_op(), 0..60)) {
            let (context, _, _) = setup();
            for op in ops {
                match op {
                    PoolOp::Add(n) => { context.add_tentative_number(n); }
                    PoolOp::Remove(n) => { context.remove_tentative_number(n); }
                    PoolOp::Accept(n) => { context.accept_issued_number(n); }
                    PoolOp::Highest(ns) => { context.update_highest(&ns.into_iter().collect()); }
                }
                prop_assert!(invariant_pools_disjoint(&context.issued(), &context.tentative()));
            }
        }

        #[test]
        fn prop_highest_is_monotonic(batches in prop::collection::vec(prop::collection::btree_set(0i64..500, 0..10), 0..20)) {
            let (context, _, _) = setup();
            let mut last = context.highest();
            for batch in batches {
                let before = context.highest();
                let update = context.update_highest(&batch);
                prop_assert!(update.highest >= last);
                prop_assert!(update.good.iter().all(|x| *x > before));
                prop_assert!(update.bad.iter().all(|x| *x <= before));
                last = update.highest;
            }
        }

        #[test]
        fn prop_committed_numbers_never_reissued(outcomes in prop::collection::vec(any::<bool>(), 1..20)) {
            let (context, _, _) = setup();
            context.update_highest(&(1..=20).collect());
            let mut consumed = BTreeSet::new();
            for success in outcomes {
                let number = context.next_transaction_number("prop").unwrap();
                prop_assert!(!consumed.contains(&number.number()));
                let value = number.number();
                number.commit(success);
                if success {
                    consumed.insert(value);
                }
            }
            prop_assert!(context.issued().is_disjoint(&consumed));
        }
    }
}
