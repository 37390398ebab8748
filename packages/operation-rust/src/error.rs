//! Error types surfaced to customer code and transport adapters.

use courier_core::Outcome;

/// Errors returned by [`Operator`](crate::Operator) methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmissionError {
    /// The operator was already terminated; customer code broke the
    /// single-writer contract by emitting again.
    #[error("operator already terminated")]
    AlreadyTerminated,
    /// Initial metadata was sent after a payload or completion.
    #[error("initial metadata must precede the first payload or completion")]
    MetadataTooLate,
    /// The operation terminated; nothing further will be transmitted.
    #[error("operation is no longer active: {0}")]
    Inactive(Outcome),
}

/// Errors returned by [`Inbound`](crate::Inbound) reads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestionError {
    /// The operation was aborted; the inbound stream closed abnormally.
    #[error("operation aborted: {0}")]
    Aborted(Outcome),
}

impl IngestionError {
    /// The outcome that closed the stream.
    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        match self {
            Self::Aborted(outcome) => outcome,
        }
    }
}

/// Error returned by a [`TicketSink`](crate::TicketSink) that could not
/// accept a ticket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The transport side has gone away.
    #[error("ticket sink disconnected")]
    Disconnected,
    /// The transport queue is full.
    #[error("ticket sink full")]
    Full,
    /// Any other transport-specific failure.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Errors from constructing a service-side operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The ticket cannot open a call: it is not sequence 0 or names no method.
    #[error("ticket {sequence_number} does not open an invocation")]
    NotLead { sequence_number: u64 },
}

/// Errors returned by [`End`](crate::End).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EndError {
    /// The end was stopped and accepts no new operations.
    #[error("end is stopped")]
    Stopped,
}
