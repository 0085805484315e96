//! # Shared Types Crate
//!
//! Domain types shared by the Notary-Sync subsystems.
//!
//! ## Modules
//!
//! - `entities`: identifiers, number aliases, nymbox hash, signature
//! - `statement`: balance-agreement statements
//! - `wire`: command and reply shapes exchanged with a notary
//! - `errors`: canonical-encoding failures

pub mod entities;
pub mod errors;
pub mod statement;
pub mod wire;

pub use entities::*;
pub use errors::*;
pub use statement::*;
pub use wire::*;
