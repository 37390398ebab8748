//! Inbound ticket entry point.
//!
//! Tickets are put back in sequence order here, then fanned out to the
//! managers responsible for each field. Stale and duplicate tickets are
//! dropped before they can touch any state.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use courier_core::{Origin, Outcome, OutcomeKind, Termination, Ticket};
use tracing::{debug, trace, warn};

use crate::managers::Managers;
use crate::operation::Role;

pub(crate) struct ReceptionManager {
    expected: u64,
    held: BTreeMap<u64, Ticket>,
    reorder_limit: usize,
}

impl ReceptionManager {
    pub(crate) fn new(reorder_limit: usize) -> Self {
        Self {
            expected: 0,
            held: BTreeMap::new(),
            reorder_limit,
        }
    }

    pub(crate) fn receive_ticket(&mut self, managers: &mut Managers, ticket: Ticket) {
        if !managers.termination.is_active() {
            trace!(
                operation_id = %ticket.operation_id,
                sequence_number = ticket.sequence_number,
                "operation inactive, dropping ticket"
            );
            return;
        }
        if ticket.operation_id != managers.operation_id() {
            debug!(
                operation_id = %managers.operation_id(),
                foreign = %ticket.operation_id,
                "dropping ticket addressed to another operation"
            );
            return;
        }

        match ticket.sequence_number.cmp(&self.expected) {
            Ordering::Less => {
                trace!(
                    operation_id = %ticket.operation_id,
                    sequence_number = ticket.sequence_number,
                    expected = self.expected,
                    "dropping stale ticket"
                );
                return;
            }
            Ordering::Greater => {
                self.hold(managers, ticket);
                return;
            }
            Ordering::Equal => {}
        }

        self.expected += 1;
        route(managers, ticket);
        while managers.termination.is_active() {
            let Some(next) = self.held.remove(&self.expected) else {
                break;
            };
            self.expected += 1;
            route(managers, next);
        }
    }

    fn hold(&mut self, managers: &mut Managers, ticket: Ticket) {
        if self.held.contains_key(&ticket.sequence_number) {
            trace!(
                operation_id = %ticket.operation_id,
                sequence_number = ticket.sequence_number,
                "dropping duplicate ticket"
            );
            return;
        }
        if self.held.len() >= self.reorder_limit {
            warn!(
                operation_id = %ticket.operation_id,
                expected = self.expected,
                held = self.held.len(),
                "sequence gap exceeded reorder limit"
            );
            self.held.clear();
            managers.abort(Outcome::erroneous(
                Origin::Local,
                "inbound sequence gap exceeded reorder limit",
            ));
            return;
        }
        self.held.insert(ticket.sequence_number, ticket);
    }
}

/// Hands each field of an in-order ticket to the manager owning it.
fn route(managers: &mut Managers, ticket: Ticket) {
    let abort = match &ticket.termination {
        Termination::Cancellation => Some(Outcome::cancelled(Origin::Remote)),
        Termination::Expiration => Some(Outcome::expired(Origin::Remote)),
        Termination::Failure { message } => Some(Outcome {
            details: message.clone(),
            ..Outcome::new(OutcomeKind::Erroneous, Origin::Remote)
        }),
        Termination::None | Termination::Completion(_) => None,
    };
    if let Some(outcome) = abort {
        managers.abort(outcome);
        return;
    }

    managers.receive_protocol(&ticket);
    if managers.role() == Role::Service {
        if ticket.sequence_number == 0 {
            managers.start_ingestion(ticket.completion().is_none());
        } else if let Some(timeout) = ticket.timeout {
            managers.change_timeout(timeout);
        }
    }
    if let Some(allowance) = ticket.allowance {
        managers.allow(allowance);
    }
    if let Some(payload) = ticket.payload {
        managers.ingest(payload);
        if !managers.termination.is_active() {
            return;
        }
    }
    if let Termination::Completion(completion) = ticket.termination {
        managers.remote_completion(completion);
    }
}
