//! # Task Handlers
//!
//! One exchange per dispatch: build, sign and send a command, then interpret
//! the reply against the context.
//!
//! ## Transaction Number Discipline
//!
//! | Reply | Number |
//! |-------|--------|
//! | `Accepted` | consumed |
//! | `TransactionFailed` | consumed (burned by the notary) |
//! | `Rejected` | returned |
//! | transient error | kept checked out for the retry |
//! | desync | kept checked out until the repair finishes |
//! | fatal error | returned |

use super::state_machine::{StateMachine, SystemOutcome};
use crate::domain::{OperationError, SystemTask, Task, TaskId, TaskKind, TaskResult};
use ns_01_consensus_context::{ManagedNumber, Verifier};
use shared_types::{
    CommandPayload, ContractId, Reply, ReplyPayload, ReplyStatus, SignedStatement, Statement,
    TransactionNumber, UnitId,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What the run loop does with a dispatched caller task.
pub(super) enum Outcome {
    /// Resolve the task.
    Done(TaskResult),
    /// Re-queue after backoff.
    Retry(String),
    /// Re-queue behind a repair.
    Repair(SystemTask),
    /// Re-queue behind a dependency that is already queued.
    Defer,
}

/// Result of one round trip, before task-specific interpretation.
enum Exchange {
    Replied(Reply),
    Rejected(Reply, String),
    TransactionFailed(Reply, String),
    /// The context must be repaired before this command can succeed.
    Desync(SystemTask),
    Unsigned,
    Failed(OperationError),
}

impl StateMachine {
    // =========================================================================
    // EXCHANGE
    // =========================================================================

    async fn exchange(
        &self,
        payload: CommandPayload,
        number: Option<TransactionNumber>,
        statement: Option<SignedStatement>,
    ) -> Exchange {
        let mut command = self.context.initialize_command(payload, number);
        command.statement = statement;
        if !self.context.finalize_command(&mut command) {
            return Exchange::Unsigned;
        }

        let sent = command.request_number;
        let kind = command.kind();
        let reply = match tokio::time::timeout(
            self.config.operation_timeout(),
            self.operation.execute(command),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Exchange::Failed(e),
            Err(_) => return Exchange::Failed(OperationError::Timeout),
        };

        if reply.kind != kind {
            return Exchange::Failed(OperationError::MalformedReply(format!(
                "sent {:?}, reply is for {:?}",
                kind, reply.kind
            )));
        }

        let sync = self
            .context
            .process_reply(&reply, sent, self.config.request_number_tolerance);
        match reply.status.clone() {
            ReplyStatus::Accepted => Exchange::Replied(reply),
            ReplyStatus::NotRegistered => Exchange::Desync(SystemTask::RegisterNym),
            ReplyStatus::NymboxOutOfDate => Exchange::Desync(SystemTask::DownloadNymbox),
            ReplyStatus::Rejected { .. } if sync.stale_request => {
                Exchange::Desync(SystemTask::Resync)
            }
            ReplyStatus::Rejected { reason } => Exchange::Rejected(reply, reason),
            ReplyStatus::TransactionFailed { reason } => {
                Exchange::TransactionFailed(reply, reason)
            }
        }
    }

    // =========================================================================
    // CALLER TASKS
    // =========================================================================

    pub(super) async fn dispatch(&self, id: TaskId, task: &Task) -> Outcome {
        if let Some(unit) = task.required_unit() {
            if let Some(outcome) = self.check_unit(unit) {
                return outcome;
            }
        }
        if task.kind().uses_transaction_number() {
            return self.dispatch_numbered(id, task).await;
        }

        let payload = task.payload(self.config.numbers_per_request);
        let outcome = match self.exchange(payload, None, None).await {
            Exchange::Replied(reply) => self.complete(task, reply),
            Exchange::Rejected(reply, reason) | Exchange::TransactionFailed(reply, reason) => {
                Outcome::Done(TaskResult::failed(Some(reply), reason))
            }
            Exchange::Desync(system) => Outcome::Repair(system),
            Exchange::Unsigned => {
                Outcome::Done(TaskResult::failed(None, "failed to sign command"))
            }
            Exchange::Failed(e) if e.is_retryable() => Outcome::Retry(e.to_string()),
            Exchange::Failed(e) => Outcome::Done(TaskResult::failed(None, e.to_string())),
        };

        // A unit whose download ended for good stays unavailable.
        if let (Task::DownloadContract { contract }, Outcome::Done(result)) = (task, &outcome) {
            if !result.success() {
                self.inner
                    .lock()
                    .unavailable_units
                    .insert(contract.clone(), result.detail.clone());
            }
        }
        outcome
    }

    /// Defer or fail a task whose unit definition is not known locally.
    fn check_unit(&self, unit: &UnitId) -> Option<Outcome> {
        let inner = self.inner.lock();
        if inner.known_units.contains(unit) {
            return None;
        }
        if let Some(reason) = inner.unavailable_units.get(unit) {
            return Some(Outcome::Done(TaskResult::failed(
                None,
                format!("unit {} unavailable: {}", unit, reason),
            )));
        }

        let download = Task::DownloadContract {
            contract: unit.clone(),
        };
        let queue = &self.queues[TaskKind::DownloadContract.index()];
        if queue.key_of(&download).is_none() {
            queue.push(TaskId::next(), download);
            debug!(
                "[ns-02] {}: fetching unit {} before dependent task",
                self.relationship, unit
            );
        }
        Some(Outcome::Defer)
    }

    async fn dispatch_numbered(&self, id: TaskId, task: &Task) -> Outcome {
        let held = self.inner.lock().held_numbers.remove(&id);
        let number = match held {
            Some(number) if self.context.is_checked_out(number.number()) => Some(number),
            Some(voided) => {
                warn!(
                    "[ns-02] {}: number {} held by {} was voided by resync",
                    self.relationship,
                    voided.number(),
                    id
                );
                voided.commit(false);
                self.context.next_transaction_number(task.kind().label())
            }
            None => self.context.next_transaction_number(task.kind().label()),
        };
        let Some(number) = number else {
            return self.no_number_available();
        };

        let n = number.number();
        let statement = self
            .context
            .build_statement(&BTreeSet::new(), &BTreeSet::from([n]));
        let Some(signed) = self.context.sign_statement(statement) else {
            number.commit(false);
            return Outcome::Done(TaskResult::failed(
                None,
                "failed to sign balance statement",
            ));
        };
        let attempts = self.inner.lock().attempts.get(&id).copied().unwrap_or(0);

        let payload = task.payload(self.config.numbers_per_request);
        match self.exchange(payload, Some(n), Some(signed)).await {
            Exchange::Replied(reply) => {
                number.commit(true);
                self.check_notary_statement(&reply);
                self.complete(task, reply)
            }
            Exchange::TransactionFailed(reply, reason) => {
                number.commit(true);
                self.check_notary_statement(&reply);
                Outcome::Done(TaskResult::failed(Some(reply), reason))
            }
            Exchange::Rejected(reply, reason) => {
                number.commit(false);
                if attempts > 0 {
                    // An earlier attempt may have been processed after all.
                    self.context.mark_stale();
                }
                Outcome::Done(TaskResult::failed(Some(reply), reason))
            }
            Exchange::Unsigned => {
                number.commit(false);
                Outcome::Done(TaskResult::failed(None, "failed to sign command"))
            }
            Exchange::Failed(e) if e.is_retryable() => {
                self.hold(id, number);
                Outcome::Retry(e.to_string())
            }
            Exchange::Failed(e) => {
                number.commit(false);
                Outcome::Done(TaskResult::failed(None, e.to_string()))
            }
            Exchange::Desync(system) => {
                self.hold(id, number);
                Outcome::Repair(system)
            }
        }
    }

    fn hold(&self, id: TaskId, number: ManagedNumber) {
        debug!(
            "[ns-02] {}: {} keeps number {} checked out",
            self.relationship,
            id,
            number.number()
        );
        self.inner.lock().held_numbers.insert(id, number);
    }

    fn no_number_available(&self) -> Outcome {
        if self.context.is_unusable() {
            return Outcome::Done(TaskResult::failed(None, "relationship is unusable"));
        }
        if self.inner.lock().replenish_suspended {
            return Outcome::Done(TaskResult::failed(
                None,
                "no transaction numbers available",
            ));
        }
        Outcome::Repair(SystemTask::GetTransactionNumbers)
    }

    /// Task-specific interpretation of an accepted reply.
    fn complete(&self, task: &Task, reply: Reply) -> Outcome {
        let applied = match task {
            Task::RegisterNym => self.apply_view(&reply).map(|()| "registered".to_string()),
            Task::GetTransactionNumbers => self.apply_numbers(&reply),
            Task::DownloadNymbox => self.apply_nymbox(&reply).map(|()| "nymbox processed".to_string()),
            Task::DownloadContract { contract } => match &reply.payload {
                ReplyPayload::Document(_) => {
                    self.learn_unit(contract.clone());
                    Ok("contract downloaded".to_string())
                }
                other => Err(unexpected(other)),
            },
            Task::IssueUnitDefinition { .. } => match &reply.payload {
                ReplyPayload::Created(id) => {
                    self.learn_unit(ContractId::new(id.clone()));
                    Ok(format!("issued unit {}", id))
                }
                other => Err(unexpected(other)),
            },
            Task::RegisterAccount { .. } => match &reply.payload {
                ReplyPayload::Created(id) => Ok(format!("registered account {}", id)),
                other => Err(unexpected(other)),
            },
            Task::DownloadMint { .. } | Task::CheckNym { .. } => match &reply.payload {
                ReplyPayload::Document(_) => Ok("document received".to_string()),
                other => Err(unexpected(other)),
            },
            _ => Ok(format!("{} accepted", task.kind())),
        };

        match applied {
            Ok(detail) => Outcome::Done(TaskResult::succeeded(Some(reply), detail)),
            Err(detail) => Outcome::Done(TaskResult::failed(Some(reply), detail)),
        }
    }

    fn learn_unit(&self, unit: UnitId) {
        let mut inner = self.inner.lock();
        inner.unavailable_units.remove(&unit);
        inner.known_units.insert(unit);
    }

    // =========================================================================
    // REPLY APPLICATION
    // =========================================================================

    fn apply_view(&self, reply: &Reply) -> Result<(), String> {
        match &reply.payload {
            ReplyPayload::ServerView(view) => {
                if self.context.apply_server_view(view) {
                    Ok(())
                } else {
                    Err("could not apply notary view".to_string())
                }
            }
            other => Err(unexpected(other)),
        }
    }

    fn apply_numbers(&self, reply: &Reply) -> Result<String, String> {
        let ReplyPayload::TransactionNumbers(numbers) = &reply.payload else {
            return Err(unexpected(&reply.payload));
        };
        let update = self.context.update_highest(numbers);
        if !update.is_consistent() {
            return Err(format!(
                "duplicate issuance of {:?}",
                update.conflicts
            ));
        }
        self.inner.lock().replenish_suspended = false;
        Ok(format!(
            "accepted {} numbers, rejected {}, highest {}",
            update.good.len(),
            update.bad.len(),
            update.highest
        ))
    }

    fn apply_nymbox(&self, reply: &Reply) -> Result<(), String> {
        let ReplyPayload::Nymbox(nymbox) = &reply.payload else {
            return Err(unexpected(&reply.payload));
        };
        let offered = nymbox.offered_numbers();
        for number in &offered {
            self.context.add_tentative_number(*number);
        }
        self.context.set_local_nymbox_hash(reply.nymbox_hash);
        info!(
            "[ns-02] {}: processed {} nymbox notices, {} numbers offered",
            self.relationship,
            nymbox.notices.len(),
            offered.len()
        );
        Ok(())
    }

    /// Confirm offered numbers the notary now lists and compare its balance
    /// statement with the local one.
    fn check_notary_statement(&self, reply: &Reply) {
        let Some(signed) = &reply.statement else {
            return;
        };
        if let Some(verifier) = &self.notary_verifier {
            if !verifier.verify(&signed.statement.preimage(), &signed.signature) {
                warn!(
                    "[ns-02] {}: notary statement signature invalid",
                    self.relationship
                );
                self.context.mark_stale();
                return;
            }
        }

        let tentative = self.context.tentative();
        let confirmed: BTreeSet<TransactionNumber> = signed
            .statement
            .issuing_set()
            .intersection(&tentative)
            .copied()
            .collect();
        if !confirmed.is_empty() {
            let issuing = Statement::new(
                self.relationship.nym.clone(),
                self.relationship.notary.clone(),
                confirmed,
            );
            self.context.accept_issued_numbers(&issuing);
        }

        if !self.context.verify_statement(&signed.statement) {
            self.context.mark_stale();
        }
    }

    // =========================================================================
    // SYSTEM TASKS
    // =========================================================================

    pub(super) async fn perform_system(&self, task: SystemTask) -> SystemOutcome {
        let payload = match task {
            SystemTask::Resync => CommandPayload::SyncContext,
            SystemTask::DownloadNymbox => CommandPayload::DownloadNymbox,
            SystemTask::RegisterNym => CommandPayload::RegisterNym,
            SystemTask::GetTransactionNumbers => CommandPayload::GetTransactionNumbers {
                count: self.config.numbers_per_request,
            },
            SystemTask::AdminLogin => {
                self.context.set_admin_attempted();
                match self.context.admin_password() {
                    Some(password) => CommandPayload::AdminLogin { password },
                    None => return SystemOutcome::Done,
                }
            }
        };

        let reply = match self.exchange(payload, None, None).await {
            Exchange::Replied(reply) => reply,
            Exchange::Desync(first) if first != task => return SystemOutcome::Repair(first),
            Exchange::Desync(_) => {
                return SystemOutcome::Failed(format!("notary still refuses {}", task))
            }
            Exchange::Rejected(_, reason) | Exchange::TransactionFailed(_, reason) => {
                return SystemOutcome::Failed(reason)
            }
            Exchange::Unsigned => {
                return SystemOutcome::Failed("failed to sign command".to_string())
            }
            Exchange::Failed(e) if e.is_retryable() => return SystemOutcome::Retry(e.to_string()),
            Exchange::Failed(e) => return SystemOutcome::Failed(e.to_string()),
        };

        let applied = match task {
            SystemTask::Resync | SystemTask::RegisterNym => self.apply_view(&reply),
            SystemTask::DownloadNymbox => self.apply_nymbox(&reply),
            SystemTask::GetTransactionNumbers => self.apply_numbers(&reply).map(|_| ()),
            SystemTask::AdminLogin => {
                self.context.set_admin_success();
                Ok(())
            }
        };
        match applied {
            Ok(()) => SystemOutcome::Done,
            Err(reason) => SystemOutcome::Failed(reason),
        }
    }
}

fn unexpected(payload: &ReplyPayload) -> String {
    format!("unexpected reply payload {:?}", payload)
}
