//! # NS-02 Task Scheduler
//!
//! Asynchronous task scheduling against notaries, one serialized state
//! machine per (nym, notary) relationship.
//!
//! **Subsystem ID:** 02
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Accept work from many callers at once, run it one exchange at a time per
//! relationship, and keep the consensus context consistent while doing so:
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | Ordering | Per-kind deduplicated FIFO queues visited in fixed priority |
//! | Transient failure | Re-queue with capped exponential backoff |
//! | Desynchronization | Repair task (resync, nymbox, registration) runs first |
//! | Number exhaustion | Acquisition repair, then automatic resumption |
//! | Invariant violation | Relationship marked unusable, pending tasks failed |
//! | Shutdown | Watch signal; in-flight step finishes, the rest resolve `ShutDown` |
//!
//! Across kinds the order is by priority, not submission. Callers with
//! dependent sequences must wait for each result before submitting the next.
//!
//! ## Module Structure
//!
//! ```text
//! ns-02-task-scheduler/
//! ├── domain/          # Task model, TaskQueue, results, backoff, errors
//! ├── ports/           # TaskScheduler (inbound), Operation (outbound), MockNotary
//! ├── application/     # StateMachine, handlers, Registry
//! └── config.rs        # SchedulerConfig
//! ```

#![warn(clippy::all)]

pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use application::{Phase, Registry, StateMachine};
pub use config::SchedulerConfig;
pub use domain::{
    retry_delay, BackgroundTask, OperationError, SchedulerError, SystemTask, Task, TaskId,
    TaskKind, TaskQueue, TaskResult, TaskStatus,
};
pub use ports::{nymbox_hash, MockNotary, Operation, TaskScheduler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
