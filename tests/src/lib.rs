//! # Notary-Sync Test Suite
//!
//! Unified test crate exercising ns-01 and ns-02 together against the
//! in-process notary.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── support.rs        # Tracing setup and fixtures
//! └── integration/
//!     ├── scenarios.rs  # Number acquisition, replay, timeout, cancellation
//!     ├── numbers.rs    # Nymbox offers, duplicate issuance, property checks
//!     └── flows.rs      # Registry lifecycle and persistence
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p ns-tests
//!
//! # With scheduler logs
//! RUST_LOG=debug cargo test -p ns-tests integration::scenarios -- --nocapture
//! ```

#![allow(dead_code)]

pub mod integration;
pub mod support;
