//! # Task Model
//!
//! Caller tasks are a tagged union with one variant per kind. The dispatcher
//! matches it exhaustively; adding a kind without a handler does not compile.
//!
//! ## Dispatch Priority
//!
//! Registration and number acquisition run first because almost everything
//! else needs both. Within one kind, tasks run FIFO. Across kinds, order is
//! by priority only, so callers with dependent sequences must wait on each
//! result before submitting the next.
//!
//! ```text
//! RegisterNym > GetTransactionNumbers > DownloadNymbox > CheckNym
//!   > DownloadContract > PublishServerContract > IssueUnitDefinition
//!   > DownloadMint > RegisterAccount > ProcessInbox > DepositPayment
//!   > SendTransfer > SendCheque > SendPayment > [WithdrawCash > PayCash]
//!   > SendMessage > PeerRequest > PeerReply
//! ```

use serde::{Deserialize, Serialize};
use shared_types::{AccountId, Amount, CommandPayload, ContractId, NymId, Payment, UnitId};
#[cfg(feature = "cash")]
use shared_types::Purse;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique, monotonically increasing task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Discriminant of a caller task. Declaration order is dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    RegisterNym,
    GetTransactionNumbers,
    DownloadNymbox,
    CheckNym,
    DownloadContract,
    PublishServerContract,
    IssueUnitDefinition,
    DownloadMint,
    RegisterAccount,
    ProcessInbox,
    DepositPayment,
    SendTransfer,
    SendCheque,
    SendPayment,
    #[cfg(feature = "cash")]
    WithdrawCash,
    #[cfg(feature = "cash")]
    PayCash,
    SendMessage,
    PeerRequest,
    PeerReply,
}

impl TaskKind {
    /// Every kind, highest priority first.
    pub const PRIORITY: &'static [TaskKind] = &[
        TaskKind::RegisterNym,
        TaskKind::GetTransactionNumbers,
        TaskKind::DownloadNymbox,
        TaskKind::CheckNym,
        TaskKind::DownloadContract,
        TaskKind::PublishServerContract,
        TaskKind::IssueUnitDefinition,
        TaskKind::DownloadMint,
        TaskKind::RegisterAccount,
        TaskKind::ProcessInbox,
        TaskKind::DepositPayment,
        TaskKind::SendTransfer,
        TaskKind::SendCheque,
        TaskKind::SendPayment,
        #[cfg(feature = "cash")]
        TaskKind::WithdrawCash,
        #[cfg(feature = "cash")]
        TaskKind::PayCash,
        TaskKind::SendMessage,
        TaskKind::PeerRequest,
        TaskKind::PeerReply,
    ];

    /// Position in [`TaskKind::PRIORITY`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Draws a transaction number before transmission.
    pub fn uses_transaction_number(self) -> bool {
        match self {
            TaskKind::ProcessInbox
            | TaskKind::DepositPayment
            | TaskKind::SendTransfer
            | TaskKind::SendCheque
            | TaskKind::SendPayment => true,
            #[cfg(feature = "cash")]
            TaskKind::WithdrawCash | TaskKind::PayCash => true,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskKind::RegisterNym => "register_nym",
            TaskKind::GetTransactionNumbers => "get_transaction_numbers",
            TaskKind::DownloadNymbox => "download_nymbox",
            TaskKind::CheckNym => "check_nym",
            TaskKind::DownloadContract => "download_contract",
            TaskKind::PublishServerContract => "publish_server_contract",
            TaskKind::IssueUnitDefinition => "issue_unit_definition",
            TaskKind::DownloadMint => "download_mint",
            TaskKind::RegisterAccount => "register_account",
            TaskKind::ProcessInbox => "process_inbox",
            TaskKind::DepositPayment => "deposit_payment",
            TaskKind::SendTransfer => "send_transfer",
            TaskKind::SendCheque => "send_cheque",
            TaskKind::SendPayment => "send_payment",
            #[cfg(feature = "cash")]
            TaskKind::WithdrawCash => "withdraw_cash",
            #[cfg(feature = "cash")]
            TaskKind::PayCash => "pay_cash",
            TaskKind::SendMessage => "send_message",
            TaskKind::PeerRequest => "peer_request",
            TaskKind::PeerReply => "peer_reply",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parameters of one caller task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Task {
    RegisterNym,
    GetTransactionNumbers,
    DownloadNymbox,
    CheckNym {
        target: NymId,
    },
    DownloadContract {
        contract: ContractId,
    },
    PublishServerContract {
        contract: ContractId,
    },
    IssueUnitDefinition {
        definition: Vec<u8>,
    },
    DownloadMint {
        unit: UnitId,
    },
    RegisterAccount {
        unit: UnitId,
        label: String,
    },
    ProcessInbox {
        account: AccountId,
    },
    DepositPayment {
        account: AccountId,
        payment: Payment,
    },
    SendTransfer {
        source: AccountId,
        destination: AccountId,
        amount: Amount,
        memo: String,
    },
    SendCheque {
        source: AccountId,
        recipient: NymId,
        amount: Amount,
        memo: String,
    },
    SendPayment {
        recipient: NymId,
        payment: Payment,
    },
    #[cfg(feature = "cash")]
    WithdrawCash {
        account: AccountId,
        unit: UnitId,
        amount: Amount,
    },
    #[cfg(feature = "cash")]
    PayCash {
        recipient: NymId,
        purse: Purse,
    },
    SendMessage {
        recipient: NymId,
        body: String,
    },
    PeerRequest {
        recipient: NymId,
        request_id: String,
        body: String,
    },
    PeerReply {
        recipient: NymId,
        request_id: String,
        body: String,
    },
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::RegisterNym => TaskKind::RegisterNym,
            Task::GetTransactionNumbers => TaskKind::GetTransactionNumbers,
            Task::DownloadNymbox => TaskKind::DownloadNymbox,
            Task::CheckNym { .. } => TaskKind::CheckNym,
            Task::DownloadContract { .. } => TaskKind::DownloadContract,
            Task::PublishServerContract { .. } => TaskKind::PublishServerContract,
            Task::IssueUnitDefinition { .. } => TaskKind::IssueUnitDefinition,
            Task::DownloadMint { .. } => TaskKind::DownloadMint,
            Task::RegisterAccount { .. } => TaskKind::RegisterAccount,
            Task::ProcessInbox { .. } => TaskKind::ProcessInbox,
            Task::DepositPayment { .. } => TaskKind::DepositPayment,
            Task::SendTransfer { .. } => TaskKind::SendTransfer,
            Task::SendCheque { .. } => TaskKind::SendCheque,
            Task::SendPayment { .. } => TaskKind::SendPayment,
            #[cfg(feature = "cash")]
            Task::WithdrawCash { .. } => TaskKind::WithdrawCash,
            #[cfg(feature = "cash")]
            Task::PayCash { .. } => TaskKind::PayCash,
            Task::SendMessage { .. } => TaskKind::SendMessage,
            Task::PeerRequest { .. } => TaskKind::PeerRequest,
            Task::PeerReply { .. } => TaskKind::PeerReply,
        }
    }

    /// Unit definition that must be known locally before dispatch.
    pub fn required_unit(&self) -> Option<&UnitId> {
        match self {
            Task::DownloadMint { unit } | Task::RegisterAccount { unit, .. } => Some(unit),
            #[cfg(feature = "cash")]
            Task::WithdrawCash { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// Command body for this task. `numbers_per_request` sizes a
    /// `GetTransactionNumbers` request.
    pub fn payload(&self, numbers_per_request: u32) -> CommandPayload {
        match self.clone() {
            Task::RegisterNym => CommandPayload::RegisterNym,
            Task::GetTransactionNumbers => CommandPayload::GetTransactionNumbers {
                count: numbers_per_request,
            },
            Task::DownloadNymbox => CommandPayload::DownloadNymbox,
            Task::CheckNym { target } => CommandPayload::CheckNym { target },
            Task::DownloadContract { contract } => CommandPayload::DownloadContract { contract },
            Task::PublishServerContract { contract } => {
                CommandPayload::PublishServerContract { contract }
            }
            Task::IssueUnitDefinition { definition } => {
                CommandPayload::IssueUnitDefinition { definition }
            }
            Task::DownloadMint { unit } => CommandPayload::DownloadMint { unit },
            Task::RegisterAccount { unit, label } => CommandPayload::RegisterAccount { unit, label },
            Task::ProcessInbox { account } => CommandPayload::ProcessInbox { account },
            Task::DepositPayment { account, payment } => {
                CommandPayload::DepositPayment { account, payment }
            }
            Task::SendTransfer {
                source,
                destination,
                amount,
                memo,
            } => CommandPayload::SendTransfer {
                source,
                destination,
                amount,
                memo,
            },
            Task::SendCheque {
                source,
                recipient,
                amount,
                memo,
            } => CommandPayload::SendCheque {
                source,
                recipient,
                amount,
                memo,
            },
            Task::SendPayment { recipient, payment } => {
                CommandPayload::SendPayment { recipient, payment }
            }
            #[cfg(feature = "cash")]
            Task::WithdrawCash {
                account,
                unit,
                amount,
            } => CommandPayload::WithdrawCash {
                account,
                unit,
                amount,
            },
            #[cfg(feature = "cash")]
            Task::PayCash { recipient, purse } => CommandPayload::PayCash { recipient, purse },
            Task::SendMessage { recipient, body } => CommandPayload::SendMessage { recipient, body },
            Task::PeerRequest {
                recipient,
                request_id,
                body,
            } => CommandPayload::PeerRequest {
                recipient,
                request_id,
                body,
            },
            Task::PeerReply {
                recipient,
                request_id,
                body,
            } => CommandPayload::PeerReply {
                recipient,
                request_id,
                body,
            },
        }
    }
}

/// Internal repair and maintenance work. Always dispatched before caller
/// tasks; caller tasks wait while any is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SystemTask {
    /// Fetch the notary's view and rebuild the context from it.
    Resync,
    DownloadNymbox,
    RegisterNym,
    GetTransactionNumbers,
    AdminLogin,
}

impl SystemTask {
    pub fn label(self) -> &'static str {
        match self {
            SystemTask::Resync => "resync",
            SystemTask::DownloadNymbox => "download_nymbox",
            SystemTask::RegisterNym => "register_nym",
            SystemTask::GetTransactionNumbers => "get_transaction_numbers",
            SystemTask::AdminLogin => "admin_login",
        }
    }
}

impl fmt::Display for SystemTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::CommandKind;

    #[test]
    fn test_task_ids_increase() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b > a);
        assert_eq!(a.to_string(), format!("task-{}", a.0));
    }

    #[test]
    fn test_priority_matches_declaration_order() {
        for (position, kind) in TaskKind::PRIORITY.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
        assert_eq!(TaskKind::PRIORITY[0], TaskKind::RegisterNym);
        assert_eq!(TaskKind::PRIORITY[1], TaskKind::GetTransactionNumbers);
    }

    #[test]
    fn test_numbered_kinds() {
        assert!(TaskKind::SendTransfer.uses_transaction_number());
        assert!(TaskKind::DepositPayment.uses_transaction_number());
        assert!(!TaskKind::SendMessage.uses_transaction_number());
        assert!(!TaskKind::GetTransactionNumbers.uses_transaction_number());
    }

    #[test]
    fn test_payload_matches_kind() {
        let task = Task::SendTransfer {
            source: AccountId::new("a"),
            destination: AccountId::new("b"),
            amount: 10,
            memo: "rent".into(),
        };
        assert_eq!(task.kind(), TaskKind::SendTransfer);
        assert_eq!(task.payload(1).kind(), CommandKind::SendTransfer);
        assert_eq!(
            Task::GetTransactionNumbers.payload(25),
            CommandPayload::GetTransactionNumbers { count: 25 }
        );
    }

    #[test]
    fn test_required_unit() {
        let unit = ContractId::new("gold");
        let task = Task::RegisterAccount {
            unit: unit.clone(),
            label: "savings".into(),
        };
        assert_eq!(task.required_unit(), Some(&unit));
        assert!(Task::RegisterNym.required_unit().is_none());
    }
}
