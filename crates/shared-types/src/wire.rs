//! # Wire Types
//!
//! Commands sent to a notary and the replies it returns. Framing and
//! transport encryption belong to the `Operation` implementation; these are
//! only the decoded shapes.
//!
//! ## Command Envelope
//!
//! | Field | Stamped by |
//! |-------|------------|
//! | `request_number` | `Context::initialize_command` |
//! | `nymbox_hash` | `Context::initialize_command` (local hash) |
//! | `acknowledged` | `Context::initialize_command` |
//! | `statement` | handler (transactional commands only) |
//! | `signature` | `Context::finalize_command` |

use crate::entities::{
    AccountId, Amount, ContractId, NymId, NotaryId, NymboxHash, RequestNumber, Signature,
    TransactionNumber, UnitId,
};
use crate::errors::EncodingError;
use crate::statement::SignedStatement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// PAYLOAD OBJECTS
// =============================================================================

/// An instrument (cheque, invoice, voucher) carried between nyms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payment {
    /// Issuer-assigned instrument identifier.
    pub id: String,
    /// Opaque signed instrument body.
    pub contents: Vec<u8>,
}

/// A set of blinded cash tokens in one unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Purse {
    /// Denominating unit.
    pub unit: UnitId,
    /// Token serial identifiers.
    pub tokens: BTreeSet<String>,
    /// Total face value.
    pub value: Amount,
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Discriminant of a command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    RegisterNym,
    GetTransactionNumbers,
    DownloadNymbox,
    SyncContext,
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
    SendMessage,
    PeerRequest,
    PeerReply,
    WithdrawCash,
    PayCash,
    AdminLogin,
}

/// Request-specific body of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandPayload {
    RegisterNym,
    GetTransactionNumbers { count: u32 },
    DownloadNymbox,
    /// Ask for the notary's authoritative view of this relationship.
    SyncContext,
    CheckNym { target: NymId },
    DownloadContract { contract: ContractId },
    PublishServerContract { contract: ContractId },
    IssueUnitDefinition { definition: Vec<u8> },
    DownloadMint { unit: UnitId },
    RegisterAccount { unit: UnitId, label: String },
    ProcessInbox { account: AccountId },
    DepositPayment { account: AccountId, payment: Payment },
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
    SendPayment { recipient: NymId, payment: Payment },
    SendMessage { recipient: NymId, body: String },
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
    WithdrawCash {
        account: AccountId,
        unit: UnitId,
        amount: Amount,
    },
    PayCash { recipient: NymId, purse: Purse },
    AdminLogin { password: String },
}

impl CommandPayload {
    /// Discriminant of this payload.
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::RegisterNym => CommandKind::RegisterNym,
            Self::GetTransactionNumbers { .. } => CommandKind::GetTransactionNumbers,
            Self::DownloadNymbox => CommandKind::DownloadNymbox,
            Self::SyncContext => CommandKind::SyncContext,
            Self::CheckNym { .. } => CommandKind::CheckNym,
            Self::DownloadContract { .. } => CommandKind::DownloadContract,
            Self::PublishServerContract { .. } => CommandKind::PublishServerContract,
            Self::IssueUnitDefinition { .. } => CommandKind::IssueUnitDefinition,
            Self::DownloadMint { .. } => CommandKind::DownloadMint,
            Self::RegisterAccount { .. } => CommandKind::RegisterAccount,
            Self::ProcessInbox { .. } => CommandKind::ProcessInbox,
            Self::DepositPayment { .. } => CommandKind::DepositPayment,
            Self::SendTransfer { .. } => CommandKind::SendTransfer,
            Self::SendCheque { .. } => CommandKind::SendCheque,
            Self::SendPayment { .. } => CommandKind::SendPayment,
            Self::SendMessage { .. } => CommandKind::SendMessage,
            Self::PeerRequest { .. } => CommandKind::PeerRequest,
            Self::PeerReply { .. } => CommandKind::PeerReply,
            Self::WithdrawCash { .. } => CommandKind::WithdrawCash,
            Self::PayCash { .. } => CommandKind::PayCash,
            Self::AdminLogin { .. } => CommandKind::AdminLogin,
        }
    }
}

/// A fully addressed request to a notary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Sender.
    pub nym: NymId,
    /// Recipient notary.
    pub notary: NotaryId,
    /// Outgoing request number.
    pub request_number: RequestNumber,
    /// Sender's local nymbox hash.
    pub nymbox_hash: NymboxHash,
    /// Replies the sender has received and not yet seen pruned.
    pub acknowledged: BTreeSet<RequestNumber>,
    /// Number consumed by this command, if transactional.
    pub transaction_number: Option<TransactionNumber>,
    /// Balance agreement, if transactional.
    pub statement: Option<SignedStatement>,
    /// Request body.
    pub payload: CommandPayload,
    /// Sender signature over [`Command::preimage`].
    pub signature: Option<Signature>,
}

impl Command {
    /// Discriminant of the payload.
    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    /// Canonical bytes to sign: the command with its signature cleared.
    pub fn preimage(&self) -> Result<Vec<u8>, EncodingError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(bincode::serialize(&unsigned)?)
    }
}

// =============================================================================
// REPLIES
// =============================================================================

/// Outcome of a command at the notary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// Processed successfully.
    Accepted,
    /// Refused at message level; no transaction number was consumed.
    Rejected { reason: String },
    /// Message processed but the transaction failed; its number is burned.
    TransactionFailed { reason: String },
    /// The nym has no account at this notary.
    NotRegistered,
    /// The command's nymbox hash does not match the notary's.
    NymboxOutOfDate,
}

impl ReplyStatus {
    /// True for [`ReplyStatus::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// One notice in a nymbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NymboxNotice {
    /// Plain message from another nym.
    Message { from: NymId, body: String },
    /// Transaction numbers the notary has set aside for this nym.
    NumbersOffered(BTreeSet<TransactionNumber>),
    /// Incoming payment instrument.
    Payment { from: NymId, payment: Payment },
    /// Peer request or reply.
    Peer {
        from: NymId,
        request_id: String,
        body: String,
    },
}

/// Downloaded nymbox contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nymbox {
    /// Hash of the box as the notary computed it.
    pub hash: NymboxHash,
    /// Notices in arrival order.
    pub notices: Vec<NymboxNotice>,
}

impl Nymbox {
    /// Every number offered by `NumbersOffered` notices.
    pub fn offered_numbers(&self) -> BTreeSet<TransactionNumber> {
        self.notices
            .iter()
            .filter_map(|notice| match notice {
                NymboxNotice::NumbersOffered(numbers) => Some(numbers.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// The notary's authoritative view of one relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerView {
    /// Last request number the notary processed.
    pub request_number: RequestNumber,
    /// Current nymbox hash.
    pub nymbox_hash: NymboxHash,
    /// Numbers issued to the nym and not yet consumed.
    pub issued: BTreeSet<TransactionNumber>,
    /// Highest number ever issued to the nym.
    pub highest: TransactionNumber,
}

/// Typed body of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    None,
    TransactionNumbers(BTreeSet<TransactionNumber>),
    Nymbox(Nymbox),
    ServerView(ServerView),
    Document(Vec<u8>),
    /// Identifier of an object the notary created (account, unit).
    Created(String),
    Purse(Purse),
}

/// Decoded notary reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Kind of the command this answers.
    pub kind: CommandKind,
    /// Last request number the notary processed (echo).
    pub request_number: RequestNumber,
    /// Outcome.
    pub status: ReplyStatus,
    /// Notary's current nymbox hash for the sender.
    pub nymbox_hash: NymboxHash,
    /// Acknowledgments the notary has recorded and the client may drop.
    pub acknowledged: BTreeSet<RequestNumber>,
    /// Typed body.
    pub payload: ReplyPayload,
    /// Notary's balance agreement, on transactional replies.
    pub statement: Option<SignedStatement>,
}
