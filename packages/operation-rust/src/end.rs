//! Registry of the operations running over one transport.
//!
//! An `End` is one side of a connection: it starts invocations, routes
//! every inbound ticket to its operation, and creates service operations
//! for calls the peer opens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{OperationId, OutcomeKind, Ticket};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::OperationConfig;
use crate::error::EndError;
use crate::operation::{
    invocation_operate_with, service_operate_with, Invocation, InvocationRequest, Operation,
};
use crate::pool::Pool;
use crate::servicer::Servicer;
use crate::sink::TicketSink;

struct EndInner {
    config: OperationConfig,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
    servicer: Option<Arc<dyn Servicer>>,
    operations: DashMap<OperationId, Operation>,
    stats: DashMap<OutcomeKind, u64>,
    accepting: AtomicBool,
}

/// One side of a connection. Cheap to clone.
#[derive(Clone)]
pub struct End {
    inner: Arc<EndInner>,
}

impl End {
    /// Creates an end sending through `sink`. Without a servicer, calls
    /// opened by the peer are dropped.
    #[must_use]
    pub fn new(
        config: OperationConfig,
        sink: Arc<dyn TicketSink>,
        pool: Arc<dyn Pool>,
        servicer: Option<Arc<dyn Servicer>>,
    ) -> Self {
        Self {
            inner: Arc::new(EndInner {
                config,
                sink,
                pool,
                servicer,
                operations: DashMap::new(),
                stats: DashMap::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Starts an invocation and tracks it until it terminates.
    ///
    /// # Errors
    ///
    /// Returns [`EndError::Stopped`] once [`End::stop`] was called.
    pub fn operate(&self, request: InvocationRequest) -> Result<Invocation, EndError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(EndError::Stopped);
        }
        // Registered before the lead ticket leaves, so no reply can arrive
        // for an operation this end does not know yet.
        Ok(invocation_operate_with(
            request,
            Arc::clone(&self.inner.sink),
            Arc::clone(&self.inner.pool),
            &self.inner.config,
            |operation| self.register(operation.clone()),
        ))
    }

    /// Routes one inbound ticket.
    pub fn receive_ticket(&self, ticket: Ticket) {
        // Cloned out so no map guard is held while the operation runs.
        let existing = self
            .inner
            .operations
            .get(&ticket.operation_id)
            .map(|entry| entry.value().clone());
        if let Some(operation) = existing {
            operation.handle_ticket(ticket);
            return;
        }

        if !ticket.is_lead() {
            debug!(
                operation_id = %ticket.operation_id,
                sequence_number = ticket.sequence_number,
                "dropping ticket for unknown operation"
            );
            return;
        }
        let Some(servicer) = self.inner.servicer.clone() else {
            debug!(operation_id = %ticket.operation_id, "no servicer, dropping call");
            return;
        };
        if !self.inner.accepting.load(Ordering::Acquire) {
            debug!(operation_id = %ticket.operation_id, "end stopped, dropping call");
            return;
        }
        let registered = service_operate_with(
            ticket,
            servicer,
            Arc::clone(&self.inner.sink),
            Arc::clone(&self.inner.pool),
            &self.inner.config,
            |operation| self.register(operation.clone()),
        );
        if let Err(err) = registered {
            debug!(error = %err, "rejected inbound call");
        }
    }

    fn register(&self, operation: Operation) {
        let id = operation.id();
        let context = operation.context();
        self.inner.operations.insert(id, operation);
        // Registered after insertion: an operation that already ended is
        // removed right away.
        let inner = Arc::downgrade(&self.inner);
        context.add_callback(move |outcome| {
            if let Some(inner) = inner.upgrade() {
                inner.operations.remove(&id);
                *inner.stats.entry(outcome.kind).or_insert(0) += 1;
            }
        });
    }

    /// Number of operations that have not yet terminated.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.operations.len()
    }

    /// Terminated operations counted by outcome kind.
    #[must_use]
    pub fn operation_stats(&self) -> HashMap<OutcomeKind, u64> {
        self.inner
            .stats
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Stops accepting calls and waits up to `grace` for running operations
    /// to finish. Whatever is left is cancelled.
    ///
    /// Returns `true` if every operation finished within the grace period.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::Release);
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            if self.inner.operations.is_empty() {
                info!("end drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining: Vec<Operation> = self
            .inner
            .operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(remaining = remaining.len(), "grace period over, cancelling operations");
        for operation in remaining {
            operation.abort(OutcomeKind::Cancelled);
        }
        false
    }
}

impl std::fmt::Debug for End {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("End")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}
