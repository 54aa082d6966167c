//! Protocol messages exchanged between getter, giver, witness and issuer
//!
//! Every message carries the thread id of the transaction it belongs to.
//! The envelope encryption and signing are handled outside this crate; the
//! types here are the logical, transport-agnostic payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::note::Note;
use super::transaction::{Did, Timeouts, TransactionId};
use super::witness_table::WitnessTable;

/// Problem report codes sent to counterparts
pub mod codes {
    pub const DID_MISMATCH: &str = "e.p.xfer.did-mismatch";
    pub const AMOUNT_MISMATCH: &str = "e.p.xfer.amount-mismatch";
    pub const INSUFFICIENT_FUNDS: &str = "e.p.xfer.insufficient-funds";
    pub const UNKNOWN_NOTE: &str = "e.p.xfer.unknown-note";
    pub const DUPLICATE_NOTE: &str = "e.p.xfer.duplicate-note";
    pub const INVALID_AMOUNT: &str = "e.p.xfer.invalid-amount";
    pub const EXPIRED: &str = "e.p.xfer.expired";
    pub const INVALID_STATE: &str = "e.p.xfer.invalid-state";
    pub const ABORTED: &str = "e.p.xfer.aborted";
    pub const INTERNAL: &str = "e.p.xfer.internal";
}

/// Payment request created by the getter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub unit_of_amount: String,
    pub getter: Did,
    pub giver: Option<Did>,
    pub witness: Option<Did>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Payment offer created by the giver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOffer {
    pub amount: Decimal,
    pub unit_of_amount: String,
    pub giver: Did,
    pub getter: Option<Did>,
    pub witness: Option<Did>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Giver's acceptance of a request, sent to the witness
///
/// Carries the original request so the witness can register the transaction
/// together with the notes the giver commits and the notes it proposes to
/// create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAcceptance {
    pub request: PaymentRequest,
    pub inputs: Vec<Note>,
    pub outputs: Vec<Note>,
}

/// Witness-notarized acceptance, forwarded to the getter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessedAcceptance {
    pub amount: Decimal,
    pub giver: Did,
    pub witness: Did,
    /// Notes the getter will own once the transfer completes
    pub outputs: Vec<Note>,
}

/// Getter's acceptance of the cash, sent to the witness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashAcceptance {
    pub amount: Decimal,
    pub accepted_at: DateTime<Utc>,
}

/// Witness-notarized cash acceptance, forwarded to the giver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessedCash {
    pub amount: Decimal,
    pub witnessed_at: DateTime<Utc>,
}

/// Notice to the old holder that its notes have been spent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashRemoval {
    pub removed: Vec<String>,
    /// Change returned to the giver
    pub change: Vec<Note>,
}

/// Final receipt of a completed transfer
///
/// The witness sends the same body to both parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub thid: TransactionId,
    pub amount: Decimal,
    pub unit_of_amount: String,
    pub getter: Did,
    pub giver: Did,
    pub witness: Did,
    pub inputs: Vec<Note>,
    pub outputs: Vec<Note>,
    pub issued_at: DateTime<Utc>,
}

impl Receipt {
    /// Notes from this receipt now owned by `did`
    pub fn notes_for(&self, did: &Did) -> Vec<Note> {
        self.outputs
            .iter()
            .filter(|n| &n.owner == did)
            .cloned()
            .collect()
    }
}

/// Issuer request to mint new notes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintRequest {
    pub amount: Decimal,
    pub unit_of_amount: String,
    pub issuer: Did,
    pub notes: Vec<Note>,
}

/// Witness confirmation that a mint was recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintResponse {
    pub note_ids: Vec<String>,
}

/// Protocol-level abort usable by any party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub code: String,
    pub comment: String,
}

/// Typed body of a protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageBody {
    Request(PaymentRequest),
    Offer(PaymentOffer),
    RequestAccepted(RequestAcceptance),
    RequestAcceptedWitnessed(WitnessedAcceptance),
    CashAccepted(CashAcceptance),
    CashAcceptedWitnessed(WitnessedCash),
    CashRemoved(CashRemoval),
    GetterReceipt(Receipt),
    GiverReceipt(Receipt),
    Mint(MintRequest),
    MintResponse(MintResponse),
    ProblemReport(ProblemReport),
    WitnessTable(WitnessTable),
    WitnessTableQuery,
}

impl MessageBody {
    /// Short message type name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Request(_) => "request",
            MessageBody::Offer(_) => "offer",
            MessageBody::RequestAccepted(_) => "request-accepted",
            MessageBody::RequestAcceptedWitnessed(_) => "request-accepted-witnessed",
            MessageBody::CashAccepted(_) => "cash-accepted",
            MessageBody::CashAcceptedWitnessed(_) => "cash-accepted-witnessed",
            MessageBody::CashRemoved(_) => "cash-removed",
            MessageBody::GetterReceipt(_) => "getter-receipt",
            MessageBody::GiverReceipt(_) => "giver-receipt",
            MessageBody::Mint(_) => "mint",
            MessageBody::MintResponse(_) => "mint-response",
            MessageBody::ProblemReport(_) => "problem-report",
            MessageBody::WitnessTable(_) => "witness-table",
            MessageBody::WitnessTableQuery => "witness-table-query",
        }
    }

    /// Whether this message may open a transaction the receiver does not know yet
    pub fn is_initiating(&self) -> bool {
        matches!(
            self,
            MessageBody::Request(_)
                | MessageBody::Offer(_)
                | MessageBody::RequestAccepted(_)
                | MessageBody::Mint(_)
        )
    }
}

/// A protocol message bound to a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub thid: TransactionId,
    pub body: MessageBody,
}

impl ProtocolMessage {
    pub fn new(thid: TransactionId, body: MessageBody) -> Self {
        ProtocolMessage { thid, body }
    }

    pub fn problem_report(thid: TransactionId, code: &str, comment: impl Into<String>) -> Self {
        ProtocolMessage::new(
            thid,
            MessageBody::ProblemReport(ProblemReport {
                code: code.to_string(),
                comment: comment.into(),
            }),
        )
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Encode as JSON for transports that carry text payloads
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
