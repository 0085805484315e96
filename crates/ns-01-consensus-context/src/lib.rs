//! # NS-01 Consensus Context
//!
//! Client-side consensus record for one (nym, notary) relationship.
//!
//! **Subsystem ID:** 01
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Track which transaction numbers the notary has issued to a nym, which are
//! spendable, which are checked out, and which request numbers and
//! acknowledgments order the conversation. A number is never duplicated,
//! lost or reused:
//!
//! | Guarantee | Mechanism |
//! |-----------|-----------|
//! | No double issuance | `update_highest` partitions around `highest`; conflicts make the context unusable |
//! | No silent loss | `ManagedNumber` returns its number unless committed as used |
//! | Balance agreement | `build_statement` / `verify_statement` over issued ∪ checked-out |
//! | Durability | every mutation bumps `revision` and writes through a `ContextStore` |
//!
//! ## Module Structure
//!
//! ```text
//! ns-01-consensus-context/
//! ├── domain/     # Context, ManagedNumber, invariants, persisted forms, errors
//! ├── ports/      # Signer, Verifier, ContextStore
//! └── adapters/   # In-memory + JSON file stores, Ed25519 signer
//! ```

#![warn(clippy::all)]

pub mod adapters;
pub mod domain;
pub mod ports;

pub use adapters::{Ed25519Signer, Ed25519Verifier, FileContextStore, InMemoryContextStore};
pub use domain::{
    canonical_set, invariant_pools_disjoint, partition_reported, raised_highest, Context,
    ContextError, ContextSnapshot, HighestUpdate, ManagedNumber, NumberPool, ReplySync,
    SerializedContext, CONTEXT_VERSION,
};
pub use ports::{ContextStore, Signer, Verifier};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
