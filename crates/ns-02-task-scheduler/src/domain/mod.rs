//! # Domain Module
//!
//! Task model, queues, results and errors for the scheduler.

pub mod backoff;
pub mod errors;
pub mod queue;
pub mod result;
pub mod task;

pub use backoff::*;
pub use errors::*;
pub use queue::*;
pub use result::*;
pub use task::*;
