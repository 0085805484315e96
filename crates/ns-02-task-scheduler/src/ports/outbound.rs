//! # Outbound Ports
//!
//! The transport a state machine drives. Signing and storage are consumed
//! through the context's own ports.

use crate::domain::OperationError;
use async_trait::async_trait;
use shared_types::{Command, Reply};

/// One request/reply exchange with a notary - outbound port.
///
/// A state machine owns exactly one `Operation` and never calls it
/// concurrently. Implementations should apply their own deadline; the
/// scheduler wraps every call in `operation_timeout` regardless.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Send a signed command and wait for its reply.
    async fn execute(&self, command: Command) -> Result<Reply, OperationError>;
}
