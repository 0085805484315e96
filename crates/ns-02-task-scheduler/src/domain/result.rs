//! # Task Results
//!
//! Every submitted task resolves exactly once. Cancelled and shut-down tasks
//! resolve explicitly, so an awaiting caller never hangs.

use super::task::TaskId;
use shared_types::Reply;
use tokio::sync::oneshot;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// The relationship closed before the task ran.
    ShutDown,
}

/// What a caller gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub status: TaskStatus,
    /// Final notary reply, when one was received.
    pub reply: Option<Reply>,
    pub detail: String,
}

impl TaskResult {
    pub fn succeeded(reply: Option<Reply>, detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            reply,
            detail: detail.into(),
        }
    }

    pub fn failed(reply: Option<Reply>, detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            reply,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            reply: None,
            detail: "cancelled".to_string(),
        }
    }

    pub fn shut_down() -> Self {
        Self {
            status: TaskStatus::ShutDown,
            reply: None,
            detail: "relationship shut down".to_string(),
        }
    }

    /// True only for [`TaskStatus::Succeeded`].
    pub fn success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct BackgroundTask {
    id: TaskId,
    result: oneshot::Receiver<TaskResult>,
}

impl BackgroundTask {
    pub(crate) fn new(id: TaskId, result: oneshot::Receiver<TaskResult>) -> Self {
        Self { id, result }
    }

    /// Identifier for cancellation and correlation.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to resolve. A dropped scheduler reads as shut down.
    pub async fn wait(self) -> TaskResult {
        self.result.await.unwrap_or_else(|_| TaskResult::shut_down())
    }

    /// Non-blocking check; `None` while still pending.
    pub fn try_result(&mut self) -> Option<TaskResult> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TaskResult::shut_down()),
        }
    }
}
