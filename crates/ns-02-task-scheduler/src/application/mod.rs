//! # Application Module
//!
//! Per-relationship state machines and the registry that runs them.

mod handlers;
pub mod registry;
pub mod state_machine;

pub use registry::Registry;
pub use state_machine::{Phase, StateMachine};
