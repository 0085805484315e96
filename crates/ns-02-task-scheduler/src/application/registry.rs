//! # Registry
//!
//! Owns one state machine and one worker per open relationship. Closing a
//! relationship, or shutting the registry down, signals the workers and
//! joins them; every task still pending resolves as shut down.

use super::state_machine::StateMachine;
use crate::config::SchedulerConfig;
use crate::domain::{BackgroundTask, SchedulerError, Task, TaskId};
use crate::ports::{Operation, TaskScheduler};
use async_trait::async_trait;
use ns_01_consensus_context::{Context, ContextSnapshot, ContextStore, Signer, Verifier};
use parking_lot::RwLock;
use shared_types::{NotaryId, NymId, RelationshipId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct Worker {
    machine: Arc<StateMachine>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn signal(&self) {
        self.machine.begin_shutdown();
        // The worker may already have exited.
        let _ = self.shutdown.send(true);
    }

    async fn join(self, relationship: &RelationshipId) {
        self.signal();
        if let Err(e) = self.handle.await {
            error!("[ns-02] {}: worker ended abnormally: {}", relationship, e);
        }
    }
}

/// Relationship registry and scheduler entry point.
pub struct Registry {
    config: SchedulerConfig,
    signer: Arc<dyn Signer>,
    store: Arc<dyn ContextStore>,
    workers: RwLock<HashMap<RelationshipId, Worker>>,
    shutting_down: AtomicBool,
}

impl Registry {
    /// Create a registry. `signer` signs for every local nym; `store` holds
    /// every context.
    pub fn new(
        config: SchedulerConfig,
        signer: Arc<dyn Signer>,
        store: Arc<dyn ContextStore>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            config,
            signer,
            store,
            workers: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Load (or create) the context for `nym` at `notary` and start its
    /// worker. Must be called from within a Tokio runtime.
    pub fn open(
        &self,
        nym: NymId,
        notary: NotaryId,
        operation: Arc<dyn Operation>,
        notary_verifier: Option<Arc<dyn Verifier>>,
    ) -> Result<RelationshipId, SchedulerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let relationship = RelationshipId::new(nym, notary);
        if self.workers.read().contains_key(&relationship) {
            return Err(SchedulerError::AlreadyOpen(relationship));
        }

        // Store I/O happens outside the map lock.
        let context = Context::load(
            relationship.clone(),
            Arc::clone(&self.signer),
            Arc::clone(&self.store),
        )?;

        let mut workers = self.workers.write();
        if workers.contains_key(&relationship) {
            return Err(SchedulerError::AlreadyOpen(relationship));
        }
        let machine = Arc::new(StateMachine::new(
            context,
            operation,
            notary_verifier,
            self.config.clone(),
        ));
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&machine).run(receiver));

        workers.insert(
            relationship.clone(),
            Worker {
                machine,
                shutdown,
                handle,
            },
        );
        info!("[ns-02] Opened relationship {}", relationship);
        Ok(relationship)
    }

    /// Cancel the pending task equal to `task` on `relationship`.
    pub fn cancel_task(&self, relationship: &RelationshipId, task: &Task) -> bool {
        self.machine(relationship)
            .is_some_and(|machine| machine.cancel_task(task))
    }

    /// Open relationships.
    pub fn relationships(&self) -> Vec<RelationshipId> {
        self.workers.read().keys().cloned().collect()
    }

    pub fn machine(&self, relationship: &RelationshipId) -> Option<Arc<StateMachine>> {
        self.workers
            .read()
            .get(relationship)
            .map(|worker| Arc::clone(&worker.machine))
    }

    /// Stop one relationship and wait for its worker.
    pub async fn close(&self, relationship: &RelationshipId) -> Result<(), SchedulerError> {
        let worker = self
            .workers
            .write()
            .remove(relationship)
            .ok_or_else(|| SchedulerError::UnknownRelationship(relationship.clone()))?;
        worker.join(relationship).await;
        info!("[ns-02] Closed relationship {}", relationship);
        Ok(())
    }
}

#[async_trait]
impl TaskScheduler for Registry {
    fn submit(
        &self,
        relationship: &RelationshipId,
        task: Task,
    ) -> Result<BackgroundTask, SchedulerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let machine = self
            .machine(relationship)
            .ok_or_else(|| SchedulerError::UnknownRelationship(relationship.clone()))?;
        machine.submit(task)
    }

    fn cancel(&self, id: TaskId) -> bool {
        self.workers
            .read()
            .values()
            .any(|worker| worker.machine.cancel(id))
    }

    fn context_snapshot(&self, relationship: &RelationshipId) -> Option<ContextSnapshot> {
        self.machine(relationship).map(|machine| machine.snapshot())
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<(RelationshipId, Worker)> = self.workers.write().drain().collect();
        info!("[ns-02] Shutting down {} relationships", workers.len());
        for (_, worker) in &workers {
            worker.signal();
        }
        for (relationship, worker) in workers {
            worker.join(&relationship).await;
        }
        info!("[ns-02] Registry shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().values() {
            worker.signal();
        }
    }
}
