//! Courier Operation: the ticket-driven lifecycle of one RPC call.
//!
//! An [`Operation`] mediates between customer code, which emits and consumes
//! values, and a transport that carries sequenced [`Ticket`]s. Deadlines,
//! cancellation, flow control and failure are handled symmetrically for
//! invoker and servicer.
//!
//! [`Ticket`]: courier_core::Ticket

pub mod config;
pub mod context;
pub mod emission;
pub mod end;
pub mod error;
mod expiration;
pub mod ingestion;
mod managers;
pub mod operation;
pub mod pool;
mod protocol;
mod reception;
pub mod servicer;
pub mod sink;
mod termination;
mod transmission;

#[cfg(test)]
mod test_support;

pub use config::OperationConfig;
pub use context::OperationContext;
pub use emission::Operator;
pub use end::End;
pub use error::{EmissionError, EndError, IngestionError, ServiceError, SinkError};
pub use ingestion::Inbound;
pub use operation::{
    invocation_operate, service_operate, Invocation, InvocationRequest, Operation, Role,
};
pub use pool::{Pool, Task, TokioPool};
pub use servicer::{service_fn, ServiceCall, ServiceFn, Servicer};
pub use sink::TicketSink;
