//! # State Machine
//!
//! Serializes all work for one relationship through a single `Operation`.
//!
//! ```text
//! Idle ──pop──→ Dispatching ──Done──→ Idle
//!                    │
//!                    └──Retry──→ Retrying ──backoff elapsed──→ Dispatching
//!
//! any state ──shutdown──→ ShuttingDown (terminal once the current step ends)
//! ```
//!
//! Each `process` call dispatches at most one task. System (repair) tasks
//! always go first; while one is queued or the context is stale, caller
//! tasks wait. Caller tasks are visited in [`TaskKind::PRIORITY`] order,
//! FIFO within a kind.
//!
//! Lock order is `inner` before any queue. No guard is held across an await.

use super::handlers::Outcome;
use crate::config::SchedulerConfig;
use crate::domain::{
    BackgroundTask, SchedulerError, SystemTask, Task, TaskId, TaskKind, TaskQueue, TaskResult,
};
use crate::ports::Operation;
use ns_01_consensus_context::{Context, ContextSnapshot, ManagedNumber, Verifier};
use parking_lot::{Mutex, MutexGuard};
use shared_types::{RelationshipId, UnitId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dispatching,
    /// The last dispatch ended in a retry; a task is waiting out its backoff.
    Retrying,
    ShuttingDown,
}

/// Outcome of a system task.
pub(super) enum SystemOutcome {
    Done,
    Retry(String),
    Repair(SystemTask),
    Failed(String),
}

pub(super) enum Job {
    System(TaskId, SystemTask),
    Caller(TaskId, Task),
}

pub(super) struct MachineState {
    pub(super) phase: Phase,
    pub(super) waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskResult>>>,
    pub(super) attempts: HashMap<TaskId, u32>,
    pub(super) not_before: HashMap<TaskId, Instant>,
    pub(super) system_attempts: HashMap<SystemTask, u32>,
    pub(super) system_not_before: HashMap<SystemTask, Instant>,
    pub(super) cancelled: HashSet<TaskId>,
    pub(super) in_flight: Option<(TaskId, Task)>,
    /// Numbers kept checked out by tasks waiting to retry.
    pub(super) held_numbers: HashMap<TaskId, ManagedNumber>,
    /// Caller tasks parked behind each repair.
    pub(super) awaiting_repair: HashMap<SystemTask, HashSet<TaskId>>,
    pub(super) known_units: HashSet<UnitId>,
    pub(super) unavailable_units: HashMap<UnitId, String>,
    pub(super) replenish_suspended: bool,
    /// Set after a fatal nymbox download; cleared once the hashes agree.
    pub(super) nymbox_repair_suspended: bool,
}

impl MachineState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            waiters: HashMap::new(),
            attempts: HashMap::new(),
            not_before: HashMap::new(),
            system_attempts: HashMap::new(),
            system_not_before: HashMap::new(),
            cancelled: HashSet::new(),
            in_flight: None,
            held_numbers: HashMap::new(),
            awaiting_repair: HashMap::new(),
            known_units: HashSet::new(),
            unavailable_units: HashMap::new(),
            replenish_suspended: false,
            nymbox_repair_suspended: false,
        }
    }

    /// Drop all bookkeeping for `id`, handing back any number it held.
    fn forget(&mut self, id: TaskId) -> Option<ManagedNumber> {
        self.attempts.remove(&id);
        self.not_before.remove(&id);
        self.cancelled.remove(&id);
        for waiting in self.awaiting_repair.values_mut() {
            waiting.remove(&id);
        }
        self.held_numbers.remove(&id)
    }

    fn settle_phase(&mut self, retrying: bool) {
        if self.phase != Phase::ShuttingDown {
            self.phase = if retrying {
                Phase::Retrying
            } else {
                Phase::Idle
            };
        }
    }
}

/// Per-relationship scheduler.
pub struct StateMachine {
    pub(super) relationship: RelationshipId,
    pub(super) context: Arc<Context>,
    pub(super) operation: Arc<dyn Operation>,
    pub(super) notary_verifier: Option<Arc<dyn Verifier>>,
    pub(super) config: SchedulerConfig,
    /// One queue per kind, indexed by [`TaskKind::index`].
    pub(super) queues: Vec<TaskQueue<Task>>,
    pub(super) system: TaskQueue<SystemTask>,
    pub(super) inner: Mutex<MachineState>,
}

impl StateMachine {
    /// Create a state machine driving `operation` for `context`.
    ///
    /// `notary_verifier` checks the notary's signature on balance
    /// statements; without one, statements are compared but not verified.
    pub fn new(
        context: Arc<Context>,
        operation: Arc<dyn Operation>,
        notary_verifier: Option<Arc<dyn Verifier>>,
        config: SchedulerConfig,
    ) -> Self {
        if config.admin_password.is_some() {
            context.set_admin_password(config.admin_password.clone());
        }
        Self {
            relationship: context.relationship().clone(),
            context,
            operation,
            notary_verifier,
            config,
            queues: TaskKind::PRIORITY.iter().map(|_| TaskQueue::new()).collect(),
            system: TaskQueue::new(),
            inner: Mutex::new(MachineState::new()),
        }
    }

    pub fn relationship(&self) -> &RelationshipId {
        &self.relationship
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.context.snapshot()
    }

    /// Caller tasks not yet resolved or dispatched.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(TaskQueue::size).sum()
    }

    /// System tasks queued.
    pub fn pending_repairs(&self) -> usize {
        self.system.size()
    }

    /// Point-in-time copy of every queued caller task.
    pub fn queued(&self) -> HashMap<Task, TaskId> {
        self.queues.iter().flat_map(TaskQueue::copy).collect()
    }

    /// Record a unit definition as available locally.
    pub fn mark_unit_known(&self, unit: UnitId) {
        let mut inner = self.inner.lock();
        inner.unavailable_units.remove(&unit);
        inner.known_units.insert(unit);
    }

    fn queue(&self, kind: TaskKind) -> &TaskQueue<Task> {
        &self.queues[kind.index()]
    }

    // =========================================================================
    // CALLER API
    // =========================================================================

    /// Queue `task`. An equal task that is queued or in flight absorbs the
    /// submission: the new handle shares its id and result.
    pub fn submit(&self, task: Task) -> Result<BackgroundTask, SchedulerError> {
        let mut inner = self.inner.lock();
        if inner.phase == Phase::ShuttingDown {
            return Err(SchedulerError::ShuttingDown);
        }

        let queue = self.queue(task.kind());
        let existing = queue.key_of(&task).or_else(|| {
            inner
                .in_flight
                .as_ref()
                .filter(|(id, flying)| flying == &task && !inner.cancelled.contains(id))
                .map(|(id, _)| *id)
        });
        let id = match existing {
            Some(id) => {
                debug!(
                    "[ns-02] {}: {} already pending as {}",
                    self.relationship,
                    task.kind(),
                    id
                );
                id
            }
            None => {
                let id = TaskId::next();
                queue.push(id, task.clone());
                debug!(
                    "[ns-02] {}: queued {} as {}",
                    self.relationship,
                    task.kind(),
                    id
                );
                id
            }
        };

        let (sender, receiver) = oneshot::channel();
        inner.waiters.entry(id).or_default().push(sender);
        Ok(BackgroundTask::new(id, receiver))
    }

    /// Cancel `id`. A queued task resolves as cancelled now; an in-flight
    /// one finishes its step and is not re-queued.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock();
        if self.queues.iter().any(|queue| queue.cancel_by_key(&id).is_some()) {
            self.release_cancelled(inner, id);
            return true;
        }

        let flying = matches!(&inner.in_flight, Some((current, _)) if *current == id);
        if flying {
            inner.cancelled.insert(id);
            info!(
                "[ns-02] {}: {} is in flight, cancelling after this attempt",
                self.relationship, id
            );
        }
        flying
    }

    /// Cancel the queued task equal to `task`.
    pub fn cancel_task(&self, task: &Task) -> bool {
        let inner = self.inner.lock();
        match self.queue(task.kind()).cancel_by_value(task) {
            Some(id) => {
                self.release_cancelled(inner, id);
                true
            }
            None => false,
        }
    }

    /// Settle a task already removed from its queue as cancelled.
    fn release_cancelled(&self, mut inner: MutexGuard<'_, MachineState>, id: TaskId) {
        let held = inner.forget(id);
        let waiters = inner.waiters.remove(&id).unwrap_or_default();
        drop(inner);
        if let Some(number) = held {
            number.commit(false);
        }
        info!("[ns-02] {}: cancelled queued {}", self.relationship, id);
        resolve(waiters, TaskResult::cancelled());
    }

    // =========================================================================
    // RUN LOOP
    // =========================================================================

    /// Poll until the shutdown signal fires, then resolve everything left.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("[ns-02] {}: state machine started", self.relationship);
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.process().await;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("[ns-02] {}: shutdown signal received", self.relationship);
        self.drain_on_shutdown();
    }

    /// One iteration: maintenance, then at most one dispatch.
    ///
    /// Returns true if a task was dispatched.
    pub async fn process(&self) -> bool {
        if self.phase() == Phase::ShuttingDown {
            return false;
        }
        if self.context.is_unusable() {
            self.fail_all("relationship is unusable");
            return false;
        }
        self.context.flush();
        self.maintain();

        match self.next_job() {
            Some(Job::System(id, task)) => {
                self.run_system(id, task).await;
                true
            }
            Some(Job::Caller(id, task)) => {
                self.run_task(id, task).await;
                true
            }
            None => false,
        }
    }

    /// Queue whatever repairs the context needs.
    fn maintain(&self) {
        if self.context.is_stale() {
            self.queue_system(SystemTask::Resync);
        } else if self.context.nymbox_hash_match() {
            self.inner.lock().nymbox_repair_suspended = false;
        } else if !self.inner.lock().nymbox_repair_suspended {
            self.queue_system(SystemTask::DownloadNymbox);
        }

        let minimum = self.config.min_spendable_numbers;
        if minimum > 0
            && !self.inner.lock().replenish_suspended
            && self.context.available_numbers() < minimum
        {
            self.queue_system(SystemTask::GetTransactionNumbers);
        }

        if self.context.admin_password().is_some() && !self.context.admin_attempted() {
            self.queue_system(SystemTask::AdminLogin);
        }
    }

    pub(super) fn queue_system(&self, task: SystemTask) {
        if self.system.key_of(&task).is_none() && self.system.push(TaskId::next(), task) {
            debug!("[ns-02] {}: queued repair {}", self.relationship, task);
        }
    }

    fn next_job(&self) -> Option<Job> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !self.system.is_empty() {
            for _ in 0..self.system.size() {
                let (id, task) = self.system.pop()?;
                let waiting = inner
                    .system_not_before
                    .get(&task)
                    .is_some_and(|at| *at > now);
                if waiting {
                    self.system.push(id, task);
                    continue;
                }
                inner.phase = Phase::Dispatching;
                return Some(Job::System(id, task));
            }
            return None;
        }

        if self.context.is_stale() {
            return None;
        }

        for kind in TaskKind::PRIORITY {
            let queue = self.queue(*kind);
            let Some((id, task)) = queue.pop() else {
                continue;
            };
            let waiting = inner.not_before.get(&id).is_some_and(|at| *at > now);
            if waiting {
                queue.push(id, task);
                continue;
            }
            inner.in_flight = Some((id, task.clone()));
            inner.phase = Phase::Dispatching;
            return Some(Job::Caller(id, task));
        }
        None
    }

    async fn run_task(&self, id: TaskId, task: Task) {
        debug!(
            "[ns-02] {}: dispatching {} ({})",
            self.relationship,
            id,
            task.kind()
        );
        match self.dispatch(id, &task).await {
            Outcome::Done(result) => {
                self.inner.lock().in_flight = None;
                self.finish_task(id, result);
                self.inner.lock().settle_phase(false);
            }
            Outcome::Retry(reason) => self.requeue(id, task, Some(reason), None),
            Outcome::Repair(system) => self.requeue(id, task, None, Some(system)),
            Outcome::Defer => self.requeue(id, task, None, None),
        }
    }

    /// Put a dispatched task back, unless it was cancelled while in flight.
    fn requeue(
        &self,
        id: TaskId,
        task: Task,
        retry_reason: Option<String>,
        repair: Option<SystemTask>,
    ) {
        let mut inner = self.inner.lock();
        inner.in_flight = None;

        if inner.cancelled.contains(&id) {
            let held = inner.forget(id);
            let waiters = inner.waiters.remove(&id).unwrap_or_default();
            inner.settle_phase(false);
            drop(inner);
            if let Some(number) = held {
                number.commit(false);
            }
            info!(
                "[ns-02] {}: {} cancelled during dispatch, not re-queued",
                self.relationship, id
            );
            resolve(waiters, TaskResult::cancelled());
            return;
        }

        let retrying = retry_reason.is_some();
        if let Some(reason) = retry_reason {
            let attempt = {
                let count = inner.attempts.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            let delay = self.config.retry_delay(attempt);
            inner.not_before.insert(id, Instant::now() + delay);
            warn!(
                "[ns-02] {}: {} ({}) attempt {} failed: {}, retrying in {:?}",
                self.relationship,
                id,
                task.kind(),
                attempt,
                reason,
                delay
            );
        }
        if let Some(system) = repair {
            inner.awaiting_repair.entry(system).or_default().insert(id);
            self.queue_system(system);
            info!(
                "[ns-02] {}: {} waits for repair {}",
                self.relationship, id, system
            );
        }
        self.queue(task.kind()).push(id, task);
        inner.settle_phase(retrying);
    }

    async fn run_system(&self, id: TaskId, task: SystemTask) {
        debug!("[ns-02] {}: running repair {}", self.relationship, task);
        let outcome = self.perform_system(task).await;
        let mut inner = self.inner.lock();
        match outcome {
            SystemOutcome::Done => {
                inner.system_attempts.remove(&task);
                inner.system_not_before.remove(&task);
                inner.awaiting_repair.remove(&task);
                inner.settle_phase(false);
                info!("[ns-02] {}: repair {} succeeded", self.relationship, task);
            }
            SystemOutcome::Retry(reason) => {
                let attempt = bump(&mut inner.system_attempts, task);
                let delay = self.config.retry_delay(attempt);
                inner.system_not_before.insert(task, Instant::now() + delay);
                self.system.push(id, task);
                inner.settle_phase(true);
                warn!(
                    "[ns-02] {}: repair {} attempt {} failed: {}, retrying in {:?}",
                    self.relationship, task, attempt, reason, delay
                );
            }
            SystemOutcome::Repair(first) => {
                self.queue_system(first);
                self.system.push(id, task);
                inner.settle_phase(false);
                info!(
                    "[ns-02] {}: repair {} needs {} first",
                    self.relationship, task, first
                );
            }
            SystemOutcome::Failed(reason) => {
                drop(inner);
                self.fail_repair(task, &reason);
            }
        }
    }

    /// A repair failed for good: fail everything waiting on it.
    fn fail_repair(&self, task: SystemTask, reason: &str) {
        error!(
            "[ns-02] {}: repair {} failed: {}",
            self.relationship, task, reason
        );
        let mut inner = self.inner.lock();

        // Throttle automatic re-queueing of the same repair.
        let attempt = bump(&mut inner.system_attempts, task);
        let delay = self.config.retry_delay(attempt);
        inner.system_not_before.insert(task, Instant::now() + delay);
        match task {
            SystemTask::GetTransactionNumbers => inner.replenish_suspended = true,
            SystemTask::DownloadNymbox => inner.nymbox_repair_suspended = true,
            _ => {}
        }

        let mut doomed: Vec<TaskId> = inner
            .awaiting_repair
            .remove(&task)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        if task == SystemTask::Resync {
            // Every caller task is blocked behind a stale context.
            for queue in &self.queues {
                doomed.extend(queue.copy().into_values());
            }
        }

        let mut failed = Vec::new();
        for id in doomed {
            if !self.queues.iter().any(|queue| queue.cancel_by_key(&id).is_some()) {
                continue;
            }
            let held = inner.forget(id);
            let waiters = inner.waiters.remove(&id).unwrap_or_default();
            failed.push((id, held, waiters));
        }
        inner.settle_phase(false);
        drop(inner);

        let detail = format!("repair {} failed: {}", task, reason);
        for (id, held, waiters) in failed {
            if let Some(number) = held {
                number.commit(false);
            }
            warn!("[ns-02] {}: failing {}: {}", self.relationship, id, detail);
            resolve(waiters, TaskResult::failed(None, detail.clone()));
        }
    }

    /// Resolve every waiter on `id`.
    pub(super) fn finish_task(&self, id: TaskId, result: TaskResult) {
        let (held, waiters) = {
            let mut inner = self.inner.lock();
            (inner.forget(id), inner.waiters.remove(&id).unwrap_or_default())
        };
        if let Some(number) = held {
            number.commit(false);
        }
        if result.success() {
            info!("[ns-02] {}: {} succeeded", self.relationship, id);
        } else {
            warn!(
                "[ns-02] {}: {} failed: {}",
                self.relationship, id, result.detail
            );
        }
        resolve(waiters, result);
    }

    /// Fail every queued task; used once the context is unusable.
    fn fail_all(&self, reason: &str) {
        let (drained, waiters) = {
            let mut inner = self.inner.lock();
            let mut drained = Vec::new();
            for queue in &self.queues {
                for (id, _) in queue.drain() {
                    drained.push(inner.forget(id));
                }
            }
            self.system.drain();
            let waiters: Vec<_> = inner.waiters.drain().collect();
            (drained, waiters)
        };
        for number in drained.into_iter().flatten() {
            number.commit(false);
        }
        if waiters.is_empty() {
            return;
        }
        error!(
            "[ns-02] {}: failing {} pending tasks: {}",
            self.relationship,
            waiters.len(),
            reason
        );
        for (_, senders) in waiters {
            resolve(senders, TaskResult::failed(None, reason));
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Stop accepting submissions.
    pub fn begin_shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::ShuttingDown {
            info!("[ns-02] {}: shutting down", self.relationship);
            inner.phase = Phase::ShuttingDown;
        }
    }

    /// Resolve every pending task as shut down and flush the context.
    pub fn drain_on_shutdown(&self) {
        self.begin_shutdown();
        let (held, waiters) = {
            let mut inner = self.inner.lock();
            for queue in &self.queues {
                queue.drain();
            }
            self.system.drain();
            let held: Vec<ManagedNumber> = inner.held_numbers.drain().map(|(_, n)| n).collect();
            inner.attempts.clear();
            inner.not_before.clear();
            inner.cancelled.clear();
            inner.awaiting_repair.clear();
            let waiters: Vec<_> = inner.waiters.drain().collect();
            (held, waiters)
        };
        for number in held {
            number.commit(false);
        }
        if !waiters.is_empty() {
            info!(
                "[ns-02] {}: resolving {} pending tasks on shutdown",
                self.relationship,
                waiters.len()
            );
        }
        for (_, senders) in waiters {
            resolve(senders, TaskResult::shut_down());
        }
        if !self.context.flush() {
            error!(
                "[ns-02] {}: context still dirty at shutdown",
                self.relationship
            );
        }
    }
}

fn bump(counts: &mut HashMap<SystemTask, u32>, task: SystemTask) -> u32 {
    let count = counts.entry(task).or_insert(0);
    *count += 1;
    *count
}

fn resolve(waiters: Vec<oneshot::Sender<TaskResult>>, result: TaskResult) {
    for waiter in waiters {
        // The caller may have dropped its handle.
        let _ = waiter.send(result.clone());
    }
}
