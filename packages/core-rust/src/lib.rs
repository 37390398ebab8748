//! Courier Core: tickets, outcomes, and the opaque values they carry.

pub mod outcome;
pub mod ticket;
pub mod value;

pub use outcome::{Origin, Outcome, OutcomeKind};
pub use ticket::{Code, Completion, OperationId, Subscription, Termination, Ticket};
pub use value::Value;
