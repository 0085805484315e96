//! # Adapters
//!
//! Port implementations: context stores and the Ed25519 signer.

pub mod ed25519;
pub mod file_store;
pub mod memory_store;

pub use ed25519::{Ed25519Signer, Ed25519Verifier};
pub use file_store::FileContextStore;
pub use memory_store::InMemoryContextStore;
