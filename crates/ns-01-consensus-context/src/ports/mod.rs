//! # Ports Module
//!
//! Outbound dependencies of the consensus context. The Context type itself is
//! the inbound API.

pub mod outbound;

pub use outbound::*;
