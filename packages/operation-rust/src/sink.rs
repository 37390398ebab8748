//! Transport-facing seam for outbound tickets.

use courier_core::Ticket;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// Enqueues outbound tickets for transmission.
///
/// Implementations must not block and must preserve the order in which
/// tickets are handed to them. An operation never calls `send` while
/// holding its lock, and never calls it concurrently with itself.
pub trait TicketSink: Send + Sync + 'static {
    /// Hands one ticket to the transport.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the transport cannot accept the ticket;
    /// the operation is then aborted as erroneous.
    fn send(&self, ticket: Ticket) -> Result<(), SinkError>;
}

impl TicketSink for mpsc::UnboundedSender<Ticket> {
    fn send(&self, ticket: Ticket) -> Result<(), SinkError> {
        mpsc::UnboundedSender::send(self, ticket).map_err(|_| SinkError::Disconnected)
    }
}

impl TicketSink for mpsc::Sender<Ticket> {
    fn send(&self, ticket: Ticket) -> Result<(), SinkError> {
        self.try_send(ticket).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }
}
