//! Cross-subsystem integration tests.

pub mod flows;
pub mod numbers;
pub mod scenarios;
