//! Protocol options and the initial-metadata handshake.
//!
//! Each direction's handshake is the first ticket carrying initial
//! metadata, a payload or a completion. Initial metadata may only be sent
//! before this side's handshake.

use courier_core::{Ticket, Value};

use crate::error::EmissionError;

pub(crate) struct ProtocolManager {
    protocol_options: Option<Value>,
    /// Filled from the lead ticket on the service side.
    awaiting_options: bool,
    remote_metadata: Option<Value>,
    handshake_received: bool,
    handshake_sent: bool,
}

impl ProtocolManager {
    /// Invoker side: the options travel on the lead ticket we send.
    pub(crate) fn invocation(protocol_options: Option<Value>) -> Self {
        Self::new(protocol_options, false)
    }

    /// Service side: the options arrive on the invoker's lead ticket.
    pub(crate) fn service() -> Self {
        Self::new(None, true)
    }

    fn new(protocol_options: Option<Value>, awaiting_options: bool) -> Self {
        Self {
            protocol_options,
            awaiting_options,
            remote_metadata: None,
            handshake_received: false,
            handshake_sent: false,
        }
    }

    pub(crate) fn protocol_options(&self) -> Option<&Value> {
        self.protocol_options.as_ref()
    }

    /// Absorbs the protocol fields of an inbound ticket. Returns `true` when
    /// this ticket completes the peer's handshake.
    pub(crate) fn receive(&mut self, ticket: &Ticket) -> bool {
        if self.awaiting_options && ticket.sequence_number == 0 {
            self.awaiting_options = false;
            self.protocol_options.clone_from(&ticket.protocol_options);
        }
        if self.handshake_received || !ticket.completes_handshake() {
            return false;
        }
        self.handshake_received = true;
        self.remote_metadata.clone_from(&ticket.initial_metadata);
        true
    }

    pub(crate) fn handshake_received(&self) -> bool {
        self.handshake_received
    }

    pub(crate) fn remote_metadata(&self) -> Option<&Value> {
        self.remote_metadata.as_ref()
    }

    /// Marks this side's handshake as begun: a payload, completion or
    /// initial metadata has been emitted.
    pub(crate) fn begin_handshake(&mut self) {
        self.handshake_sent = true;
    }

    /// Validates and records an initial-metadata send.
    pub(crate) fn send_initial_metadata(&mut self) -> Result<(), EmissionError> {
        if self.handshake_sent {
            return Err(EmissionError::MetadataTooLate);
        }
        self.handshake_sent = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Completion, OperationId, Termination};

    use super::*;

    #[test]
    fn service_takes_options_from_lead() {
        let mut manager = ProtocolManager::service();
        let mut lead = Ticket::new(OperationId::generate(), 0);
        lead.protocol_options = Some(Value::from("gzip"));
        manager.receive(&lead);
        assert_eq!(manager.protocol_options(), Some(&Value::from("gzip")));
    }

    #[test]
    fn invocation_keeps_local_options() {
        let mut manager = ProtocolManager::invocation(Some(Value::Int(2)));
        let mut reply = Ticket::new(OperationId::generate(), 0);
        reply.protocol_options = Some(Value::Int(9));
        manager.receive(&reply);
        assert_eq!(manager.protocol_options(), Some(&Value::Int(2)));
    }

    #[test]
    fn handshake_completes_on_first_carrying_ticket() {
        let id = OperationId::generate();
        let mut manager = ProtocolManager::invocation(None);

        let mut grant = Ticket::new(id, 0);
        grant.allowance = Some(4);
        assert!(!manager.receive(&grant));
        assert!(!manager.handshake_received());

        let mut metadata = Ticket::new(id, 1);
        metadata.initial_metadata = Some(Value::from("server-v1"));
        assert!(manager.receive(&metadata));
        assert_eq!(manager.remote_metadata(), Some(&Value::from("server-v1")));

        let mut done = Ticket::new(id, 2);
        done.initial_metadata = Some(Value::from("ignored"));
        done.termination = Termination::Completion(Completion::ok());
        assert!(!manager.receive(&done));
        assert_eq!(manager.remote_metadata(), Some(&Value::from("server-v1")));
    }

    #[test]
    fn payload_handshake_carries_no_metadata() {
        let mut manager = ProtocolManager::service();
        let mut lead = Ticket::new(OperationId::generate(), 0);
        lead.payload = Some(Value::Int(1));
        assert!(manager.receive(&lead));
        assert!(manager.remote_metadata().is_none());
    }

    #[test]
    fn metadata_after_handshake_is_rejected() {
        let mut manager = ProtocolManager::service();
        assert_eq!(manager.send_initial_metadata(), Ok(()));
        assert_eq!(
            manager.send_initial_metadata(),
            Err(EmissionError::MetadataTooLate)
        );

        let mut manager = ProtocolManager::service();
        manager.begin_handshake();
        assert_eq!(
            manager.send_initial_metadata(),
            Err(EmissionError::MetadataTooLate)
        );
    }
}
