//! # Ports Module
//!
//! Hexagonal architecture ports (inbound API, outbound transport) and the
//! in-process notary used by tests.

pub mod inbound;
pub mod mock_notary;
pub mod outbound;

pub use inbound::*;
pub use mock_notary::*;
pub use outbound::*;
