//! Outbound ticket assembly.
//!
//! Every ticket the peer observes is built here, so sequence numbering,
//! allowance accounting and "have we told the peer we are done" cannot race.
//! The manager is pure bookkeeping: the operation drives a single send loop
//! on the pool that repeatedly asks for [`TransmissionManager::next_ticket`]
//! and hands the result to the ticket sink outside the lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{Completion, OperationId, Outcome, Subscription, Termination, Ticket, Value};
use tokio::sync::Notify;

/// Payload credit an invoker starts with before the servicer grants any.
const INITIAL_INVOCATION_ALLOWANCE: u64 = 1;

/// Fields of the lead ticket of an invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct KickOff {
    pub(crate) group: String,
    pub(crate) method: String,
    pub(crate) subscription: Subscription,
    pub(crate) timeout: Option<Duration>,
    pub(crate) protocol_options: Option<Value>,
    pub(crate) initial_metadata: Option<Value>,
    pub(crate) payload: Option<Value>,
    pub(crate) completion: Option<Completion>,
    pub(crate) allowance: u64,
}

/// A ticket ready for the sink.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) ticket: Ticket,
    /// Whether this ticket carries this side's completion.
    pub(crate) completes: bool,
}

pub(crate) struct TransmissionManager {
    operation_id: OperationId,
    next_sequence: u64,
    lead: Option<Ticket>,
    remote_subscription: Subscription,
    remote_allowance: u64,
    payloads: VecDeque<Value>,
    capacity: usize,
    initial_metadata: Option<Value>,
    grant: u64,
    timeout: Option<Duration>,
    completion: Option<Completion>,
    abortion: Option<Termination>,
    transmitting: bool,
    closed: bool,
    ready: Arc<Notify>,
}

impl TransmissionManager {
    /// Invoker side. Its lead ticket must be supplied with [`Self::kick_off`].
    pub(crate) fn invocation(operation_id: OperationId, capacity: usize) -> Self {
        Self::new(
            operation_id,
            Subscription::Full,
            INITIAL_INVOCATION_ALLOWANCE,
            capacity,
        )
    }

    /// Service side, filtering by the invoker's declared subscription.
    pub(crate) fn service(
        operation_id: OperationId,
        remote_subscription: Subscription,
        capacity: usize,
    ) -> Self {
        Self::new(operation_id, remote_subscription, 0, capacity)
    }

    fn new(
        operation_id: OperationId,
        remote_subscription: Subscription,
        remote_allowance: u64,
        capacity: usize,
    ) -> Self {
        Self {
            operation_id,
            next_sequence: 0,
            lead: None,
            remote_subscription,
            remote_allowance,
            payloads: VecDeque::new(),
            capacity: capacity.max(1),
            initial_metadata: None,
            grant: 0,
            timeout: None,
            completion: None,
            abortion: None,
            transmitting: false,
            closed: false,
            ready: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever queue space frees up or transmission closes.
    pub(crate) fn ready(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    /// Builds the lead ticket (sequence 0) of an invocation.
    pub(crate) fn kick_off(&mut self, kick_off: KickOff) {
        let mut ticket = Ticket::new(self.operation_id, 0);
        ticket.group = Some(kick_off.group);
        ticket.method = Some(kick_off.method);
        ticket.subscription = Some(kick_off.subscription);
        ticket.timeout = kick_off.timeout;
        ticket.protocol_options = kick_off.protocol_options;
        ticket.initial_metadata = kick_off.initial_metadata;
        if kick_off.payload.is_some() {
            self.remote_allowance = self.remote_allowance.saturating_sub(1);
        }
        ticket.payload = kick_off.payload;
        if kick_off.allowance > 0 {
            ticket.allowance = Some(kick_off.allowance);
        }
        if let Some(completion) = kick_off.completion {
            ticket.termination = Termination::Completion(completion);
        }
        self.lead = Some(ticket);
        self.next_sequence = 1;
    }

    /// Queues one payload, or hands it back when the queue is full.
    ///
    /// Payloads the peer did not subscribe to are accepted and discarded
    /// before any allowance is spent on them.
    pub(crate) fn offer(&mut self, payload: Value) -> Result<(), Value> {
        if self.closed || !self.remote_subscription.wants_values() {
            return Ok(());
        }
        if self.payloads.len() >= self.capacity {
            return Err(payload);
        }
        self.payloads.push_back(payload);
        Ok(())
    }

    /// Queues initial metadata for the next ticket.
    pub(crate) fn send_initial_metadata(&mut self, metadata: Value) {
        if !self.closed && self.remote_subscription.wants_values() {
            self.initial_metadata = Some(metadata);
        }
    }

    /// Queues this side's completion; it follows every queued payload.
    pub(crate) fn complete(&mut self, completion: Completion) {
        if !self.closed {
            self.completion = Some(completion);
        }
    }

    /// Grants the peer `allowance` more payloads.
    pub(crate) fn grant(&mut self, allowance: u64) {
        if !self.closed {
            self.grant += allowance;
        }
    }

    /// Records allowance the peer granted us.
    pub(crate) fn allow(&mut self, allowance: u64) {
        self.remote_allowance = self.remote_allowance.saturating_add(allowance);
    }

    /// Queues a revised timeout for the peer.
    pub(crate) fn change_timeout(&mut self, timeout: Duration) {
        if !self.closed {
            self.timeout = Some(timeout);
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_payloads(&self) -> usize {
        self.payloads.len()
    }

    fn has_work(&self) -> bool {
        if self.abortion.is_some() {
            return true;
        }
        if self.closed {
            return false;
        }
        self.lead.is_some()
            || self.initial_metadata.is_some()
            || self.grant > 0
            || self.timeout.is_some()
            || (!self.payloads.is_empty() && self.remote_allowance > 0)
            || (self.payloads.is_empty() && self.completion.is_some())
    }

    /// Claims the send loop. Returns `true` when the caller must start one.
    pub(crate) fn kick(&mut self) -> bool {
        if self.transmitting || !self.has_work() {
            return false;
        }
        self.transmitting = true;
        true
    }

    /// Produces the next ticket for the send loop, or releases the loop.
    pub(crate) fn next_ticket(&mut self) -> Option<Outgoing> {
        if let Some(termination) = self.abortion.take() {
            let mut ticket = Ticket::new(self.operation_id, self.next_sequence);
            self.next_sequence += 1;
            ticket.termination = termination;
            return Some(Outgoing {
                ticket,
                completes: false,
            });
        }
        if self.closed {
            self.transmitting = false;
            return None;
        }
        if let Some(lead) = self.lead.take() {
            let completes = lead.completion().is_some();
            return Some(Outgoing {
                ticket: lead,
                completes,
            });
        }

        let mut ticket = Ticket::new(self.operation_id, self.next_sequence);
        ticket.initial_metadata = self.initial_metadata.take();
        if self.remote_allowance > 0 {
            if let Some(payload) = self.payloads.pop_front() {
                self.remote_allowance -= 1;
                ticket.payload = Some(payload);
                self.ready.notify_waiters();
            }
        }
        if self.grant > 0 {
            ticket.allowance = Some(std::mem::take(&mut self.grant));
        }
        ticket.timeout = self.timeout.take();
        let mut completes = false;
        if self.payloads.is_empty() {
            if let Some(completion) = self.completion.take() {
                ticket.termination = Termination::Completion(completion);
                completes = true;
            }
        }

        let empty = ticket.initial_metadata.is_none()
            && ticket.payload.is_none()
            && ticket.allowance.is_none()
            && ticket.timeout.is_none()
            && !completes;
        if empty {
            self.transmitting = false;
            return None;
        }
        self.next_sequence += 1;
        Some(Outgoing { ticket, completes })
    }

    /// Stops transmission, queuing one ticket telling the peer about
    /// `outcome` when the peer needs to hear about it.
    pub(crate) fn abort(&mut self, outcome: &Outcome) {
        if self.closed {
            return;
        }
        // A peer that never saw the lead ticket has nothing to abort.
        let lead_sent = self.lead.take().is_none();
        self.abortion = if lead_sent {
            outcome.abort_termination()
        } else {
            None
        };
        self.close();
    }

    /// Stops transmission after the sink failed; nothing more is attempted.
    pub(crate) fn fail(&mut self) {
        self.abortion = None;
        self.close();
    }

    /// Stops transmission after natural termination.
    pub(crate) fn terminate(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.closed = true;
        self.lead = None;
        self.payloads.clear();
        self.initial_metadata = None;
        self.grant = 0;
        self.timeout = None;
        self.completion = None;
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Code, Origin};

    use super::*;

    fn service(capacity: usize) -> TransmissionManager {
        TransmissionManager::service(OperationId::generate(), Subscription::Full, capacity)
    }

    fn drain(manager: &mut TransmissionManager) -> Vec<Ticket> {
        let mut tickets = Vec::new();
        if !manager.kick() {
            return tickets;
        }
        while let Some(outgoing) = manager.next_ticket() {
            tickets.push(outgoing.ticket);
        }
        tickets
    }

    fn echo_kick_off(payload: Option<Value>, completion: Option<Completion>) -> KickOff {
        KickOff {
            group: "echo".to_string(),
            method: "Say".to_string(),
            timeout: Some(Duration::from_secs(1)),
            payload,
            completion,
            allowance: 8,
            ..KickOff::default()
        }
    }

    #[test]
    fn kick_off_emits_lead_ticket() {
        let mut manager = TransmissionManager::invocation(OperationId::generate(), 4);
        manager.kick_off(echo_kick_off(Some(Value::from("ping")), Some(Completion::default())));

        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 1);
        let lead = &tickets[0];
        assert_eq!(lead.sequence_number, 0);
        assert!(lead.is_lead());
        assert_eq!(lead.subscription, Some(Subscription::Full));
        assert_eq!(lead.payload, Some(Value::from("ping")));
        assert_eq!(lead.allowance, Some(8));
        assert!(lead.completion().is_some());
    }

    #[test]
    fn sequence_numbers_increase_without_gaps() {
        let mut manager = service(8);
        manager.allow(10);
        for i in 0..3 {
            assert_eq!(manager.offer(Value::Int(i)), Ok(()));
        }
        manager.complete(Completion::ok());

        let tickets = drain(&mut manager);
        let sequence: Vec<u64> = tickets.iter().map(|t| t.sequence_number).collect();
        assert_eq!(sequence, vec![0, 1, 2]);
        assert!(tickets[2].completion().is_some());
    }

    #[test]
    fn completion_follows_every_payload() {
        let mut manager = service(8);
        manager.allow(2);
        manager.offer(Value::Int(1)).unwrap();
        manager.offer(Value::Int(2)).unwrap();
        manager.offer(Value::Int(3)).unwrap();
        manager.complete(Completion::ok());

        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 2);
        assert!(tickets.iter().all(|t| t.completion().is_none()));

        manager.allow(1);
        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].payload, Some(Value::Int(3)));
        assert!(tickets[0].completion().is_some());
    }

    #[test]
    fn no_payload_without_allowance() {
        let mut manager = service(8);
        manager.offer(Value::from("held")).unwrap();
        assert!(drain(&mut manager).is_empty());
        assert_eq!(manager.queued_payloads(), 1);

        manager.allow(1);
        let tickets = drain(&mut manager);
        assert_eq!(tickets[0].payload, Some(Value::from("held")));
    }

    #[test]
    fn invocation_gets_one_payload_before_any_grant() {
        let mut manager = TransmissionManager::invocation(OperationId::generate(), 8);
        manager.kick_off(echo_kick_off(None, None));
        manager.offer(Value::Int(1)).unwrap();
        manager.offer(Value::Int(2)).unwrap();

        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[1].payload, Some(Value::Int(1)));
        assert_eq!(manager.queued_payloads(), 1);
    }

    #[test]
    fn full_queue_hands_payload_back() {
        let mut manager = service(2);
        manager.offer(Value::Int(1)).unwrap();
        manager.offer(Value::Int(2)).unwrap();
        assert_eq!(manager.offer(Value::Int(3)), Err(Value::Int(3)));
    }

    #[test]
    fn termination_only_subscription_filters_values() {
        let mut manager =
            TransmissionManager::service(OperationId::generate(), Subscription::TerminationOnly, 1);
        manager.send_initial_metadata(Value::from("md"));
        for i in 0..5 {
            assert_eq!(manager.offer(Value::Int(i)), Ok(()));
        }
        manager.complete(Completion::with_status(Code(3), "bad"));

        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 1);
        assert!(tickets[0].payload.is_none());
        assert!(tickets[0].initial_metadata.is_none());
        assert_eq!(tickets[0].completion().unwrap().code, Some(Code(3)));
    }

    #[test]
    fn grant_rides_on_next_ticket() {
        let mut manager = service(4);
        manager.grant(3);
        manager.grant(2);
        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].allowance, Some(5));
    }

    #[test]
    fn abort_sends_single_termination_then_stops() {
        let mut manager = TransmissionManager::invocation(OperationId::generate(), 4);
        manager.kick_off(echo_kick_off(None, None));
        drain(&mut manager);
        manager.offer(Value::Int(1)).unwrap();

        manager.abort(&Outcome::cancelled(Origin::Local));
        manager.abort(&Outcome::expired(Origin::Local));
        let tickets = drain(&mut manager);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].sequence_number, 1);
        assert_eq!(tickets[0].termination, Termination::Cancellation);

        manager.offer(Value::Int(2)).unwrap();
        manager.grant(4);
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn remote_abort_is_not_echoed() {
        let mut manager = service(4);
        manager.abort(&Outcome::cancelled(Origin::Remote));
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn abort_before_lead_sent_is_silent() {
        let mut manager = TransmissionManager::invocation(OperationId::generate(), 4);
        manager.kick_off(echo_kick_off(None, None));
        manager.abort(&Outcome::cancelled(Origin::Local));
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn failure_suppresses_abort_ticket() {
        let mut manager = service(4);
        manager.fail();
        manager.abort(&Outcome::erroneous(Origin::Local, "sink"));
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn kick_claims_loop_once() {
        let mut manager = service(4);
        manager.grant(1);
        assert!(manager.kick());
        assert!(!manager.kick());
        assert!(manager.next_ticket().is_some());
        assert!(manager.next_ticket().is_none());
        manager.grant(1);
        assert!(manager.kick());
    }
}
