//! Tickets: the sequenced envelopes exchanged with the transport.
//!
//! One ticket describes one unit of progress of a call in one direction.
//! Every ticket of a call shares the call's [`OperationId`]; each direction
//! numbers its tickets from 0 without gaps.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

/// Opaque identity shared by every ticket of one call.
///
/// Assigned once when the invocation is created and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// How much of the response stream the invoker wants observed.
///
/// The serving side uses the invoker's subscription to skip generating
/// tickets the invoker would discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Subscription {
    /// Not interested in values or metadata.
    None,
    /// Only interested in how the call terminates.
    TerminationOnly,
    /// Full duplex: metadata, every payload, and termination.
    #[default]
    Full,
}

impl Subscription {
    /// Whether payloads and initial metadata should be delivered.
    #[must_use]
    pub fn wants_values(self) -> bool {
        matches!(self, Self::Full)
    }
}

// ---------------------------------------------------------------------------
// Code / Completion
// ---------------------------------------------------------------------------

/// Application-level status code carried by a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code(pub u32);

impl Code {
    /// The success status.
    pub const OK: Code = Code(0);

    /// Returns `true` for the success status.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final status of one direction of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Metadata sent along with the final status.
    pub terminal_metadata: Option<Value>,
    /// Application status code. Invokers usually leave this unset.
    pub code: Option<Code>,
    /// Human-readable status message.
    pub message: Option<String>,
}

impl Completion {
    /// Completion carrying the OK status.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: Some(Code::OK),
            ..Self::default()
        }
    }

    /// Completion carrying the given status code and message.
    #[must_use]
    pub fn with_status(code: Code, message: impl Into<String>) -> Self {
        Self {
            terminal_metadata: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Termination signal carried by a ticket.
///
/// Modeled as a tagged union so that "is this the last ticket" never depends
/// on which optional status fields happen to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    /// The call continues after this ticket.
    #[default]
    None,
    /// No more payloads follow; the sender ended normally with a status.
    Completion(Completion),
    /// Abort immediately.
    Cancellation,
    /// The sender's deadline passed.
    Expiration,
    /// The sender failed locally (customer fault, transport failure).
    Failure {
        /// Diagnostic detail, if any.
        message: Option<String>,
    },
}

impl Termination {
    /// Whether this ends the sender's side of the call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether this is one of the abortive terminations.
    #[must_use]
    pub fn is_abortive(&self) -> bool {
        matches!(
            self,
            Self::Cancellation | Self::Expiration | Self::Failure { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// One sequenced envelope of a call's bidirectional stream.
///
/// `group`, `method`, `subscription` and `protocol_options` are only set on
/// the lead ticket (sequence number 0) of an invocation. `timeout` is set on
/// the lead ticket and on later tickets that revise the deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub operation_id: OperationId,
    pub sequence_number: u64,
    pub group: Option<String>,
    pub method: Option<String>,
    pub subscription: Option<Subscription>,
    pub timeout: Option<Duration>,
    pub protocol_options: Option<Value>,
    pub initial_metadata: Option<Value>,
    pub payload: Option<Value>,
    /// Flow-control credit granted to the receiver of this ticket.
    pub allowance: Option<u64>,
    pub termination: Termination,
}

impl Ticket {
    /// Creates a ticket carrying nothing but its identity and position.
    #[must_use]
    pub fn new(operation_id: OperationId, sequence_number: u64) -> Self {
        Self {
            operation_id,
            sequence_number,
            group: None,
            method: None,
            subscription: None,
            timeout: None,
            protocol_options: None,
            initial_metadata: None,
            payload: None,
            allowance: None,
            termination: Termination::None,
        }
    }

    /// Whether this ticket opens an invocation (sequence 0 naming a method).
    #[must_use]
    pub fn is_lead(&self) -> bool {
        self.sequence_number == 0 && self.group.is_some() && self.method.is_some()
    }

    /// Whether the receiver's handshake is satisfied by this ticket.
    ///
    /// Initial metadata may only precede the first payload or completion, so
    /// the first ticket carrying any of the three completes the handshake.
    #[must_use]
    pub fn completes_handshake(&self) -> bool {
        self.initial_metadata.is_some()
            || self.payload.is_some()
            || matches!(self.termination, Termination::Completion(_))
    }

    /// Returns the carried completion, if this is a completion ticket.
    #[must_use]
    pub fn completion(&self) -> Option<&Completion> {
        match &self.termination {
            Termination::Completion(completion) => Some(completion),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ticket_carries_nothing() {
        let id = OperationId::generate();
        let ticket = Ticket::new(id, 3);
        assert_eq!(ticket.operation_id, id);
        assert_eq!(ticket.sequence_number, 3);
        assert!(ticket.payload.is_none());
        assert!(ticket.allowance.is_none());
        assert_eq!(ticket.termination, Termination::None);
        assert!(!ticket.is_lead());
        assert!(!ticket.completes_handshake());
    }

    #[test]
    fn lead_requires_sequence_zero_and_method() {
        let mut ticket = Ticket::new(OperationId::generate(), 0);
        assert!(!ticket.is_lead());
        ticket.group = Some("echo".to_string());
        ticket.method = Some("Say".to_string());
        assert!(ticket.is_lead());
        ticket.sequence_number = 1;
        assert!(!ticket.is_lead());
    }

    #[test]
    fn allowance_only_ticket_does_not_complete_handshake() {
        let mut ticket = Ticket::new(OperationId::generate(), 0);
        ticket.allowance = Some(4);
        assert!(!ticket.completes_handshake());
        ticket.termination = Termination::Completion(Completion::ok());
        assert!(ticket.completes_handshake());
        assert_eq!(ticket.completion(), Some(&Completion::ok()));
    }

    #[test]
    fn termination_classification() {
        assert!(!Termination::None.is_terminal());
        assert!(Termination::Completion(Completion::default()).is_terminal());
        assert!(!Termination::Completion(Completion::default()).is_abortive());
        assert!(Termination::Cancellation.is_abortive());
        assert!(Termination::Expiration.is_abortive());
        assert!(Termination::Failure { message: None }.is_abortive());
    }

    #[test]
    fn status_helpers() {
        assert!(Code::OK.is_ok());
        assert!(!Code(5).is_ok());
        let completion = Completion::with_status(Code(5), "not found");
        assert_eq!(completion.code, Some(Code(5)));
        assert_eq!(completion.message.as_deref(), Some("not found"));
        assert_eq!(Completion::ok().code, Some(Code::OK));
    }

    #[test]
    fn only_full_subscription_wants_values() {
        assert!(Subscription::Full.wants_values());
        assert!(!Subscription::TerminationOnly.wants_values());
        assert!(!Subscription::None.wants_values());
        assert_eq!(Subscription::default(), Subscription::Full);
    }

    #[test]
    fn ticket_survives_serde() {
        let mut ticket = Ticket::new(OperationId::generate(), 0);
        ticket.group = Some("echo".to_string());
        ticket.method = Some("Say".to_string());
        ticket.timeout = Some(Duration::from_millis(250));
        ticket.payload = Some(Value::from("ping"));
        ticket.termination = Termination::Completion(Completion::ok());

        let json = serde_json::to_string(&ticket).unwrap();
        let decoded: Ticket = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ticket);
    }
}
