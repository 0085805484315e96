//! # Mock Notary
//!
//! In-process `Operation` that keeps a notary's books for any number of nyms.
//! Faults are queued and consumed one per `execute` call, in order.

use super::outbound::Operation;
use crate::domain::OperationError;
use async_trait::async_trait;
use ns_01_consensus_context::Signer;
use parking_lot::Mutex;
use shared_types::{
    Command, CommandKind, CommandPayload, ContractId, NotaryId, NymId, Nymbox, NymboxHash,
    NymboxNotice, Payment, Purse, Reply, ReplyPayload, ReplyStatus, RequestNumber, ServerView,
    Signature, SignedStatement, Statement, TransactionNumber,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

enum Fault {
    Error(OperationError),
    ErrorAfter(Duration, OperationError),
    Delay(Duration),
    Reject(String),
    FailTransaction(String),
    Desync(i64),
    ReplayLastNumbers,
    ForceNumbers(BTreeSet<TransactionNumber>),
    CorruptStatement,
}

#[derive(Default)]
struct NymAccount {
    request_number: RequestNumber,
    issued: BTreeSet<TransactionNumber>,
    highest: TransactionNumber,
    nymbox: Vec<NymboxNotice>,
    offered: BTreeSet<TransactionNumber>,
}

impl NymAccount {
    fn nymbox_hash(&self) -> NymboxHash {
        nymbox_hash(&self.nymbox)
    }

    fn view(&self) -> ServerView {
        ServerView {
            request_number: self.request_number,
            nymbox_hash: self.nymbox_hash(),
            issued: self.issued.clone(),
            highest: self.highest,
        }
    }
}

struct NotaryState {
    next_number: TransactionNumber,
    nyms: HashMap<NymId, NymAccount>,
    contracts: HashMap<ContractId, Vec<u8>>,
    next_account: u64,
    last_numbers: BTreeSet<TransactionNumber>,
    faults: VecDeque<Fault>,
    calls: Vec<CommandKind>,
    admin_password: Option<String>,
}

impl NotaryState {
    fn allocate(&mut self, nym: &NymId, count: u32) -> BTreeSet<TransactionNumber> {
        let first = self.next_number;
        self.next_number += TransactionNumber::from(count);
        let numbers: BTreeSet<TransactionNumber> = (first..self.next_number).collect();
        let account = self.nyms.entry(nym.clone()).or_default();
        account.issued.extend(numbers.iter().copied());
        account.highest = account.highest.max(self.next_number - 1);
        numbers
    }

    fn deliver(&mut self, recipient: &NymId, notice: NymboxNotice) -> bool {
        match self.nyms.get_mut(recipient) {
            Some(account) => {
                account.nymbox.push(notice);
                true
            }
            None => false,
        }
    }
}

/// Hash of a nymbox's notices; an empty box hashes to the zero value.
pub fn nymbox_hash(notices: &[NymboxNotice]) -> NymboxHash {
    if notices.is_empty() {
        return NymboxHash::default();
    }
    bincode::serialize(notices)
        .map(|bytes| NymboxHash::of(&bytes))
        .unwrap_or_default()
}

/// Mock notary for testing.
pub struct MockNotary {
    notary: NotaryId,
    signer: Option<Arc<dyn Signer>>,
    state: Mutex<NotaryState>,
}

impl MockNotary {
    /// Notary that issues numbers from 1 and leaves statements unsigned.
    pub fn new(notary: NotaryId) -> Self {
        Self {
            notary,
            signer: None,
            state: Mutex::new(NotaryState {
                next_number: 1,
                nyms: HashMap::new(),
                contracts: HashMap::new(),
                next_account: 1,
                last_numbers: BTreeSet::new(),
                faults: VecDeque::new(),
                calls: Vec::new(),
                admin_password: None,
            }),
        }
    }

    /// First transaction number to issue.
    pub fn with_first_number(self, first: TransactionNumber) -> Self {
        self.state.lock().next_number = first;
        self
    }

    /// Sign balance statements with `signer`.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn notary(&self) -> &NotaryId {
        &self.notary
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Next call fails with `error`.
    pub fn fail_next(&self, error: OperationError) {
        self.push_fault(Fault::Error(error));
    }

    /// Next call fails with `error` after `delay`.
    pub fn fail_next_after(&self, delay: Duration, error: OperationError) {
        self.push_fault(Fault::ErrorAfter(delay, error));
    }

    /// Next call is answered normally after `delay`.
    pub fn delay_next(&self, delay: Duration) {
        self.push_fault(Fault::Delay(delay));
    }

    /// Next call is refused at message level.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.push_fault(Fault::Reject(reason.into()));
    }

    /// Next transactional call burns its number and fails.
    pub fn fail_transaction_next(&self, reason: impl Into<String>) {
        self.push_fault(Fault::FailTransaction(reason.into()));
    }

    /// Next reply echoes a request number off by `offset`.
    pub fn desync_next(&self, offset: i64) {
        self.push_fault(Fault::Desync(offset));
    }

    /// Next `GetTransactionNumbers` re-delivers the previous batch.
    pub fn replay_last_numbers(&self) {
        self.push_fault(Fault::ReplayLastNumbers);
    }

    /// Next `GetTransactionNumbers` reports exactly `numbers`.
    pub fn force_next_numbers(&self, numbers: BTreeSet<TransactionNumber>) {
        self.push_fault(Fault::ForceNumbers(numbers));
    }

    /// Next balance statement lists a number that was never issued.
    pub fn corrupt_next_statement(&self) {
        self.push_fault(Fault::CorruptStatement);
    }

    fn push_fault(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    // =========================================================================
    // SERVER-SIDE SETUP AND INSPECTION
    // =========================================================================

    /// Create an account for `nym` without a round trip.
    pub fn register_nym(&self, nym: &NymId) {
        self.state.lock().nyms.entry(nym.clone()).or_default();
    }

    /// Store a contract document; returns its identifier.
    pub fn publish_contract(&self, document: &[u8]) -> ContractId {
        let id = ContractId::for_document(document);
        self.state
            .lock()
            .contracts
            .insert(id.clone(), document.to_vec());
        id
    }

    /// Drop a notice into `nym`'s nymbox.
    pub fn push_notice(&self, nym: &NymId, notice: NymboxNotice) -> bool {
        self.state.lock().deliver(nym, notice)
    }

    /// Issue `count` numbers to `nym` through its nymbox rather than a reply.
    pub fn offer_numbers(&self, nym: &NymId, count: u32) -> BTreeSet<TransactionNumber> {
        let mut state = self.state.lock();
        let numbers = state.allocate(nym, count);
        if let Some(account) = state.nyms.get_mut(nym) {
            account.offered.extend(numbers.iter().copied());
            account
                .nymbox
                .push(NymboxNotice::NumbersOffered(numbers.clone()));
        }
        numbers
    }

    pub fn set_admin_password(&self, password: impl Into<String>) {
        self.state.lock().admin_password = Some(password.into());
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<CommandKind> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Numbers the notary considers issued to `nym` and unspent.
    pub fn issued_to(&self, nym: &NymId) -> BTreeSet<TransactionNumber> {
        self.state
            .lock()
            .nyms
            .get(nym)
            .map(|account| account.issued.clone())
            .unwrap_or_default()
    }

    /// Current nymbox hash for `nym`.
    pub fn nymbox_hash_of(&self, nym: &NymId) -> NymboxHash {
        self.state
            .lock()
            .nyms
            .get(nym)
            .map(NymAccount::nymbox_hash)
            .unwrap_or_default()
    }

    // =========================================================================
    // REQUEST HANDLING
    // =========================================================================

    fn respond(&self, state: &mut NotaryState, command: &Command, fault: Option<Fault>) -> Reply {
        let kind = command.kind();
        let nym = &command.nym;

        if kind == CommandKind::RegisterNym {
            state.nyms.entry(nym.clone()).or_default();
        }
        let Some(account) = state.nyms.get_mut(nym) else {
            return Reply {
                kind,
                request_number: command.request_number,
                status: ReplyStatus::NotRegistered,
                nymbox_hash: NymboxHash::default(),
                acknowledged: BTreeSet::new(),
                payload: ReplyPayload::None,
                statement: None,
            };
        };

        if command.transaction_number.is_some() && command.nymbox_hash != account.nymbox_hash() {
            return Reply {
                kind,
                request_number: command.request_number,
                status: ReplyStatus::NymboxOutOfDate,
                nymbox_hash: account.nymbox_hash(),
                acknowledged: command.acknowledged.clone(),
                payload: ReplyPayload::None,
                statement: None,
            };
        }

        account.request_number = command.request_number;
        let echo = match &fault {
            Some(Fault::Desync(offset)) => command.request_number + offset,
            _ => command.request_number,
        };

        let (status, payload, statement) = match fault {
            Some(Fault::Reject(reason)) => (ReplyStatus::Rejected { reason }, ReplyPayload::None, None),
            fault => self.handle(state, command, fault),
        };

        let nymbox_hash = state
            .nyms
            .get(nym)
            .map(NymAccount::nymbox_hash)
            .unwrap_or_default();
        Reply {
            kind,
            request_number: echo,
            status,
            nymbox_hash,
            acknowledged: command.acknowledged.clone(),
            payload,
            statement,
        }
    }

    fn handle(
        &self,
        state: &mut NotaryState,
        command: &Command,
        fault: Option<Fault>,
    ) -> (ReplyStatus, ReplyPayload, Option<SignedStatement>) {
        let nym = &command.nym;
        let rejected = |reason: &str| -> (ReplyStatus, ReplyPayload, Option<SignedStatement>) {
            (
                ReplyStatus::Rejected {
                    reason: reason.to_string(),
                },
                ReplyPayload::None,
                None,
            )
        };
        let accepted = |payload: ReplyPayload| -> (ReplyStatus, ReplyPayload, Option<SignedStatement>) {
            (ReplyStatus::Accepted, payload, None)
        };

        match &command.payload {
            CommandPayload::RegisterNym | CommandPayload::SyncContext => {
                let view = state.nyms.get(nym).map(NymAccount::view);
                match view {
                    Some(view) => accepted(ReplyPayload::ServerView(view)),
                    None => rejected("unknown nym"),
                }
            }
            CommandPayload::GetTransactionNumbers { count } => {
                let numbers = match fault {
                    Some(Fault::ReplayLastNumbers) => state.last_numbers.clone(),
                    Some(Fault::ForceNumbers(numbers)) => {
                        if let Some(account) = state.nyms.get_mut(nym) {
                            account.issued.extend(numbers.iter().copied());
                        }
                        numbers
                    }
                    _ => state.allocate(nym, *count),
                };
                state.last_numbers = numbers.clone();
                accepted(ReplyPayload::TransactionNumbers(numbers))
            }
            CommandPayload::DownloadNymbox => {
                let Some(account) = state.nyms.get_mut(nym) else {
                    return rejected("unknown nym");
                };
                let hash = account.nymbox_hash();
                let notices = std::mem::take(&mut account.nymbox);
                accepted(ReplyPayload::Nymbox(Nymbox { hash, notices }))
            }
            CommandPayload::CheckNym { target } => {
                if state.nyms.contains_key(target) {
                    accepted(ReplyPayload::Document(target.as_str().as_bytes().to_vec()))
                } else {
                    rejected("unknown nym")
                }
            }
            CommandPayload::DownloadContract { contract } => match state.contracts.get(contract) {
                Some(document) => accepted(ReplyPayload::Document(document.clone())),
                None => rejected("unknown contract"),
            },
            CommandPayload::PublishServerContract { .. } => accepted(ReplyPayload::None),
            CommandPayload::IssueUnitDefinition { definition } => {
                let id = ContractId::for_document(definition);
                state.contracts.insert(id.clone(), definition.clone());
                accepted(ReplyPayload::Created(id.0))
            }
            CommandPayload::DownloadMint { unit } => {
                if state.contracts.contains_key(unit) {
                    accepted(ReplyPayload::Document(format!("mint:{}", unit.0).into_bytes()))
                } else {
                    rejected("unknown unit")
                }
            }
            CommandPayload::RegisterAccount { unit, .. } => {
                if !state.contracts.contains_key(unit) {
                    return rejected("unknown unit");
                }
                let id = format!("acct-{}", state.next_account);
                state.next_account += 1;
                accepted(ReplyPayload::Created(id))
            }
            CommandPayload::SendMessage { recipient, body } => {
                let notice = NymboxNotice::Message {
                    from: nym.clone(),
                    body: body.clone(),
                };
                if state.deliver(recipient, notice) {
                    accepted(ReplyPayload::None)
                } else {
                    rejected("unknown recipient")
                }
            }
            CommandPayload::PeerRequest {
                recipient,
                request_id,
                body,
            }
            | CommandPayload::PeerReply {
                recipient,
                request_id,
                body,
            } => {
                let notice = NymboxNotice::Peer {
                    from: nym.clone(),
                    request_id: request_id.clone(),
                    body: body.clone(),
                };
                if state.deliver(recipient, notice) {
                    accepted(ReplyPayload::None)
                } else {
                    rejected("unknown recipient")
                }
            }
            CommandPayload::AdminLogin { password } => {
                if state.admin_password.as_deref() == Some(password.as_str()) {
                    accepted(ReplyPayload::None)
                } else {
                    rejected("bad admin password")
                }
            }
            CommandPayload::ProcessInbox { .. }
            | CommandPayload::DepositPayment { .. }
            | CommandPayload::SendTransfer { .. }
            | CommandPayload::SendCheque { .. }
            | CommandPayload::SendPayment { .. }
            | CommandPayload::WithdrawCash { .. }
            | CommandPayload::PayCash { .. } => self.transact(state, command, fault),
        }
    }

    /// Check the balance statement, burn the number, apply the transaction.
    fn transact(
        &self,
        state: &mut NotaryState,
        command: &Command,
        fault: Option<Fault>,
    ) -> (ReplyStatus, ReplyPayload, Option<SignedStatement>) {
        let nym = &command.nym;
        let rejected = |reason: String| -> (ReplyStatus, ReplyPayload, Option<SignedStatement>) {
            (ReplyStatus::Rejected { reason }, ReplyPayload::None, None)
        };

        let Some(number) = command.transaction_number else {
            return rejected("transaction number required".into());
        };
        let Some(account) = state.nyms.get_mut(nym) else {
            return rejected("unknown nym".into());
        };
        if !account.issued.contains(&number) {
            return rejected(format!("number {} not issued", number));
        }
        let Some(signed) = &command.statement else {
            return rejected("balance statement required".into());
        };

        // The client may list offered numbers it has confirmed, or omit them.
        let mut remaining = account.issued.clone();
        remaining.remove(&number);
        let floor: BTreeSet<TransactionNumber> =
            remaining.difference(&account.offered).copied().collect();
        let listed = signed.statement.issuing_set();
        if signed.statement.nym() != nym
            || signed.statement.notary() != &self.notary
            || !listed.is_subset(&remaining)
            || !listed.is_superset(&floor)
        {
            return rejected("balance statement mismatch".into());
        }

        account.issued.remove(&number);
        let mut agreed = account.issued.clone();
        account.offered.clear();

        let (status, corrupt) = match fault {
            Some(Fault::FailTransaction(reason)) => (ReplyStatus::TransactionFailed { reason }, false),
            Some(Fault::CorruptStatement) => (ReplyStatus::Accepted, true),
            _ => (ReplyStatus::Accepted, false),
        };
        if corrupt {
            agreed.insert(account.highest + 1_000);
        }

        let mut payload = ReplyPayload::None;
        if status.is_accepted() {
            match &command.payload {
                CommandPayload::SendCheque {
                    recipient,
                    amount,
                    memo,
                    ..
                } => {
                    let cheque = Payment {
                        id: format!("cheque-{}", number),
                        contents: format!("{}:{}", amount, memo).into_bytes(),
                    };
                    state.deliver(
                        recipient,
                        NymboxNotice::Payment {
                            from: nym.clone(),
                            payment: cheque,
                        },
                    );
                }
                CommandPayload::SendPayment { recipient, payment } => {
                    state.deliver(
                        recipient,
                        NymboxNotice::Payment {
                            from: nym.clone(),
                            payment: payment.clone(),
                        },
                    );
                }
                CommandPayload::PayCash { recipient, purse } => {
                    let payment = Payment {
                        id: format!("cash-{}", number),
                        contents: purse
                            .tokens
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(",")
                            .into_bytes(),
                    };
                    state.deliver(
                        recipient,
                        NymboxNotice::Payment {
                            from: nym.clone(),
                            payment,
                        },
                    );
                }
                CommandPayload::WithdrawCash { unit, amount, .. } => {
                    payload = ReplyPayload::Purse(Purse {
                        unit: unit.clone(),
                        tokens: [format!("token-{}", number)].into_iter().collect(),
                        value: *amount,
                    });
                }
                _ => {}
            }
        }

        let statement = Statement::new(nym.clone(), self.notary.clone(), agreed);
        (status, payload, Some(self.sign(statement)))
    }

    fn sign(&self, statement: Statement) -> SignedStatement {
        // Zero signature when no notary key is configured.
        let signature = self
            .signer
            .as_ref()
            .and_then(|signer| signer.sign(&statement.preimage()))
            .unwrap_or_else(|| Signature::from_bytes([0u8; 64]));
        SignedStatement {
            statement,
            signature,
        }
    }
}

#[async_trait]
impl Operation for MockNotary {
    async fn execute(&self, command: Command) -> Result<Reply, OperationError> {
        let fault = {
            let mut state = self.state.lock();
            state.calls.push(command.kind());
            state.faults.pop_front()
        };
        debug!(
            "[ns-02] mock notary received {:?} #{} from {}",
            command.kind(),
            command.request_number,
            command.nym
        );

        if command.signature.is_none() {
            return Err(OperationError::SignatureRejected);
        }

        let fault = match fault {
            Some(Fault::Error(error)) => return Err(error),
            Some(Fault::ErrorAfter(delay, error)) => {
                tokio::time::sleep(delay).await;
                return Err(error);
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                None
            }
            other => other,
        };

        let mut state = self.state.lock();
        Ok(self.respond(&mut state, &command, fault))
    }
}
