//! Transaction-related types for the value transfer protocol
//!
//! This module defines identifiers, the shared transaction state machine,
//! negotiated timeouts and the `Transaction` itself.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Receipt;
use super::note::Note;

/// Decentralized identifier of a protocol participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn new(did: impl Into<String>) -> Self {
        Did(did.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(value: &str) -> Self {
        Did(value.to_string())
    }
}

/// Transaction identifier
///
/// Doubles as the thread id carried by every message of one protocol run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a fresh random (UUIDv4) transaction id
    pub fn generate() -> Self {
        TransactionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        TransactionId(value.to_string())
    }
}

/// Role under which the local agent holds a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Payee: ends up holding the value
    Getter,
    /// Payer: relinquishes the value
    Giver,
    /// Mediator that notarizes each step and moves cash ownership
    Witness,
    /// Mints new value through a witness
    Issuer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Getter => "getter",
            Role::Giver => "giver",
            Role::Witness => "witness",
            Role::Issuer => "issuer",
        };
        f.write_str(name)
    }
}

/// Protocol state of a transaction
///
/// Shared by every role. A state only ever moves forward along the edges
/// accepted by [`TransactionState::can_transition_to`]; `Completed` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    RequestSent,
    RequestReceived,
    RequestForOfferReceived,
    OfferSent,
    OfferReceived,
    RequestAcceptedSent,
    RequestAcceptedReceived,
    RequestAcceptedWitnessed,
    CashAcceptedSent,
    CashAcceptedReceived,
    CashAcceptedWitnessed,
    CashRemoved,
    Completed,
    Failed,
}

impl TransactionState {
    /// Whether the state accepts no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }

    /// Whether `next` is a legal successor of `self`
    ///
    /// This is the union of the per-role transition tables. Any non-terminal
    /// state may fail; terminal states accept nothing.
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }

        match self {
            // Getter awaiting the witnessed acceptance, a counter-offer, or
            // an issuer awaiting its mint response.
            RequestSent => matches!(next, OfferReceived | RequestAcceptedReceived | Completed),
            // Giver accepting, or a witness notarizing / minting.
            RequestReceived => {
                matches!(next, RequestAcceptedSent | RequestAcceptedWitnessed | Completed)
            }
            RequestForOfferReceived => next == RequestAcceptedSent,
            OfferSent => next == RequestForOfferReceived,
            OfferReceived => next == RequestSent,
            // Witness messages may reach the giver in any order.
            RequestAcceptedSent => matches!(next, CashAcceptedReceived | CashRemoved | Completed),
            RequestAcceptedReceived => next == CashAcceptedSent,
            RequestAcceptedWitnessed => next == CashAcceptedWitnessed,
            CashAcceptedSent => next == Completed,
            CashAcceptedReceived => matches!(next, CashRemoved | Completed),
            CashAcceptedWitnessed => next == CashRemoved,
            CashRemoved => next == Completed,
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-stage deadlines negotiated by the initiating party
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Latest instant at which the giver's acceptance may be witnessed
    pub giver: Option<DateTime<Utc>>,

    /// Latest instant at which the witness may notarize the cash acceptance
    pub witness: Option<DateTime<Utc>>,
}

impl Timeouts {
    /// Build absolute deadlines from durations measured from now
    pub fn within(giver: Option<Duration>, witness: Option<Duration>) -> Self {
        let now = Utc::now();
        let deadline = |d: Duration| {
            chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
        };
        Timeouts {
            giver: giver.and_then(deadline),
            witness: witness.and_then(deadline),
        }
    }

    pub fn giver_expired(&self, now: DateTime<Utc>) -> bool {
        self.giver.is_some_and(|deadline| now > deadline)
    }

    pub fn witness_expired(&self, now: DateTime<Utc>) -> bool {
        self.witness.is_some_and(|deadline| now > deadline)
    }
}

/// Error payload recorded on a failed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemError {
    pub code: String,
    pub comment: String,
}

/// The unit of protocol state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque unique identifier, also the thread id
    pub id: TransactionId,

    pub state: TransactionState,

    pub amount: Decimal,

    pub unit_of_amount: String,

    /// Parties, filled in progressively as they become known
    pub getter: Option<Did>,
    pub giver: Option<Did>,
    pub witness: Option<Did>,

    pub timeouts: Timeouts,

    /// Set when the transaction moves to `Failed`
    pub error: Option<ProblemError>,

    /// Counterpart of the local party once known
    pub second_party_did: Option<Did>,

    /// DID that must send the next message for this transaction
    pub expected_recipient_did: Option<Did>,

    /// Notes committed by the giver
    #[serde(default)]
    pub inputs: Vec<Note>,

    /// Notes created by the move: payment to the getter plus change
    #[serde(default)]
    pub outputs: Vec<Note>,

    #[serde(default)]
    pub receipt: Option<Receipt>,

    /// Whether the local wallet effect of this transaction was applied
    #[serde(default)]
    pub cash_settled: bool,
}

impl Transaction {
    pub fn new(id: TransactionId, state: TransactionState, amount: Decimal, unit: &str) -> Self {
        Transaction {
            id,
            state,
            amount,
            unit_of_amount: unit.to_string(),
            getter: None,
            giver: None,
            witness: None,
            timeouts: Timeouts::default(),
            error: None,
            second_party_did: None,
            expected_recipient_did: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            receipt: None,
            cash_settled: false,
        }
    }

    /// Every known participant DID
    pub fn participants(&self) -> impl Iterator<Item = &Did> {
        [&self.getter, &self.giver, &self.witness]
            .into_iter()
            .flatten()
    }

    pub fn is_participant(&self, did: &Did) -> bool {
        self.participants().any(|p| p == did)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TransactionState::*;

    #[rstest]
    #[case::getter_request(RequestSent, RequestAcceptedReceived)]
    #[case::counter_offer(RequestSent, OfferReceived)]
    #[case::giver_accept(RequestReceived, RequestAcceptedSent)]
    #[case::witness_accept(RequestReceived, RequestAcceptedWitnessed)]
    #[case::offer_then_request(OfferSent, RequestForOfferReceived)]
    #[case::accept_offer(OfferReceived, RequestSent)]
    #[case::cash_accept(RequestAcceptedReceived, CashAcceptedSent)]
    #[case::witness_cash(RequestAcceptedWitnessed, CashAcceptedWitnessed)]
    #[case::witness_remove(CashAcceptedWitnessed, CashRemoved)]
    #[case::getter_receipt(CashAcceptedSent, Completed)]
    #[case::giver_receipt_early(RequestAcceptedSent, Completed)]
    #[case::fail_midway(CashAcceptedSent, Failed)]
    fn test_allowed_transitions(#[case] from: TransactionState, #[case] to: TransactionState) {
        assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
    }

    #[rstest]
    #[case::completed_to_failed(Completed, Failed)]
    #[case::failed_to_completed(Failed, Completed)]
    #[case::backwards(CashAcceptedSent, RequestSent)]
    #[case::skip_witness(RequestAcceptedWitnessed, Completed)]
    #[case::self_loop(RequestSent, RequestSent)]
    fn test_rejected_transitions(#[case] from: TransactionState, #[case] to: TransactionState) {
        assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
    }

    #[test]
    fn test_timeouts_expiry() {
        let timeouts = Timeouts::within(Some(Duration::from_secs(60)), None);
        let now = Utc::now();
        assert!(!timeouts.giver_expired(now));
        assert!(timeouts.giver_expired(now + chrono::Duration::seconds(120)));
        assert!(!timeouts.witness_expired(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_participants() {
        let mut tx = Transaction::new(TransactionId::generate(), RequestSent, Decimal::ONE, "credit");
        tx.getter = Some(Did::from("did:peer:getter"));
        tx.witness = Some(Did::from("did:peer:witness"));

        assert_eq!(tx.participants().count(), 2);
        assert!(tx.is_participant(&Did::from("did:peer:witness")));
        assert!(!tx.is_participant(&Did::from("did:peer:giver")));
    }
}
