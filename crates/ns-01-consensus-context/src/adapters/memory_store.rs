//! In-memory `ContextStore` for tests and ephemeral sessions.

use crate::domain::SerializedContext;
use crate::ports::ContextStore;
use parking_lot::RwLock;
use shared_types::RelationshipId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

/// HashMap-backed context store.
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: RwLock<HashMap<RelationshipId, SerializedContext>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored relationships.
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}

impl ContextStore for InMemoryContextStore {
    fn load_context(&self, relationship: &RelationshipId) -> Option<SerializedContext> {
        self.contexts.read().get(relationship).cloned()
    }

    fn store_context(&self, context: &SerializedContext) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return false;
        }
        let mut contexts = self.contexts.write();
        if let Some(existing) = contexts.get(&context.relationship) {
            if existing.revision > context.revision {
                warn!(
                    "[ns-01] Refusing to overwrite {} revision {} with {}",
                    context.relationship, existing.revision, context.revision
                );
                return false;
            }
        }
        contexts.insert(context.relationship.clone(), context.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        true
    }
}
