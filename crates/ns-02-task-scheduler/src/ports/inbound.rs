//! # Inbound Ports
//!
//! API trait defining what callers can ask of the scheduler.

use crate::domain::{BackgroundTask, SchedulerError, Task, TaskId};
use async_trait::async_trait;
use ns_01_consensus_context::ContextSnapshot;
use shared_types::RelationshipId;

/// Task scheduler API - inbound port.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Queue `task` for `relationship`. Submitting a task equal to one still
    /// pending returns a handle to the pending one.
    fn submit(
        &self,
        relationship: &RelationshipId,
        task: Task,
    ) -> Result<BackgroundTask, SchedulerError>;

    /// Cancel a task. Queued tasks resolve as cancelled at once; an in-flight
    /// task finishes its current step and is not retried.
    fn cancel(&self, id: TaskId) -> bool;

    /// Read-only view of a relationship's context.
    fn context_snapshot(&self, relationship: &RelationshipId) -> Option<ContextSnapshot>;

    /// Stop every worker and resolve every pending task.
    async fn shutdown(&self);
}
