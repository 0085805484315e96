//! # Domain Module
//!
//! Core types for the consensus context.

pub mod context;
pub mod errors;
pub mod invariants;
pub mod managed_number;
pub mod serialized;
pub mod value_objects;

pub use context::*;
pub use errors::*;
pub use invariants::*;
pub use managed_number::*;
pub use serialized::*;
pub use value_objects::*;
