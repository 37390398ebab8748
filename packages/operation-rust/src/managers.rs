//! The operation core: every manager behind one lock.
//!
//! All bookkeeping happens inside [`Shared::run`]. Anything that may run
//! customer code or re-enter the operation (termination callbacks, pool
//! submissions) is deferred until the lock is released, so the lock is
//! never held across application code and never taken recursively.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::task::Poll;
use std::time::Duration;

use courier_core::{
    Completion, OperationId, Origin, Outcome, OutcomeKind, Subscription, Ticket, Value,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::OperationConfig;
use crate::context::OperationContext;
use crate::emission::{Abandon, EmissionManager, Emitted, Operator};
use crate::error::{EmissionError, IngestionError, SinkError};
use crate::expiration::{ExpirationManager, Timer};
use crate::ingestion::{Inbound, IngestionManager, Launcher, Pulled};
use crate::operation::Role;
use crate::pool::{Pool, Task};
use crate::protocol::ProtocolManager;
use crate::reception::ReceptionManager;
use crate::servicer::ServiceCall;
use crate::sink::TicketSink;
use crate::termination::{Terminated, TerminationCallback, TerminationManager};
use crate::transmission::{KickOff, TransmissionManager};

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Work queued under the lock and performed right after it is released.
pub(crate) enum Deferred {
    Submit(Task),
    Callback(TerminationCallback, Outcome),
}

/// State of one operation, shared by its facade, context, operator,
/// inbound reader and pool tasks.
pub(crate) struct Shared {
    operation_id: OperationId,
    core: Mutex<OperationCore>,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
}

impl Shared {
    pub(crate) fn new(
        operation_id: OperationId,
        sink: Arc<dyn TicketSink>,
        pool: Arc<dyn Pool>,
        build: impl FnOnce(Weak<Shared>) -> OperationCore,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            operation_id,
            core: Mutex::new(build(weak.clone())),
            sink,
            pool,
        })
    }

    pub(crate) fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Runs `f` under the operation lock, then performs the deferred work
    /// it queued.
    pub(crate) fn run<R>(&self, f: impl FnOnce(&mut OperationCore) -> R) -> R {
        let (result, deferred) = {
            let mut core = self.core.lock();
            let result = f(&mut core);
            (result, std::mem::take(&mut core.managers.deferred))
        };
        for action in deferred {
            match action {
                Deferred::Submit(task) => self.pool.submit(task),
                Deferred::Callback(callback, outcome) => fire(callback, &outcome),
            }
        }
        result
    }
}

fn fire(callback: TerminationCallback, outcome: &Outcome) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        warn!(outcome = %outcome, "termination callback panicked");
    }
}

pub(crate) struct OperationCore {
    pub(crate) reception: ReceptionManager,
    pub(crate) managers: Managers,
}

impl OperationCore {
    pub(crate) fn new(managers: Managers, config: &OperationConfig) -> Self {
        Self {
            reception: ReceptionManager::new(config.reorder_limit),
            managers,
        }
    }

    pub(crate) fn handle_ticket(&mut self, ticket: Ticket) {
        self.reception.receive_ticket(&mut self.managers, ticket);
    }
}

// ---------------------------------------------------------------------------
// Managers
// ---------------------------------------------------------------------------

/// The managers of one operation and the orchestration between them.
pub(crate) struct Managers {
    operation_id: OperationId,
    role: Role,
    group: String,
    method: String,
    pub(crate) termination: TerminationManager,
    pub(crate) transmission: TransmissionManager,
    pub(crate) expiration: ExpirationManager,
    pub(crate) protocol: ProtocolManager,
    pub(crate) emission: EmissionManager,
    pub(crate) ingestion: IngestionManager,
    deferred: Vec<Deferred>,
    shared: Weak<Shared>,
}

/// Identity of the call a service operation serves.
pub(crate) struct ServiceSetup {
    pub(crate) group: String,
    pub(crate) method: String,
    /// The invoker's subscription, from the lead ticket.
    pub(crate) remote_subscription: Subscription,
    /// This side's subscription, from the servicer.
    pub(crate) local_subscription: Subscription,
    pub(crate) timeout: Option<Duration>,
    pub(crate) launcher: Launcher,
}

impl Managers {
    pub(crate) fn invocation(
        operation_id: OperationId,
        subscription: Subscription,
        protocol_options: Option<Value>,
        timeout: Option<Duration>,
        config: &OperationConfig,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            operation_id,
            role: Role::Invocation,
            group: String::new(),
            method: String::new(),
            termination: TerminationManager::invocation(),
            transmission: TransmissionManager::invocation(
                operation_id,
                config.emission_queue_capacity,
            ),
            expiration: ExpirationManager::new(timeout, config.maximum_timeout),
            protocol: ProtocolManager::invocation(protocol_options),
            emission: EmissionManager::invocation(),
            ingestion: IngestionManager::invocation(subscription, config.ingestion_window),
            deferred: Vec::new(),
            shared,
        }
    }

    pub(crate) fn service(
        operation_id: OperationId,
        setup: ServiceSetup,
        config: &OperationConfig,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            operation_id,
            role: Role::Service,
            group: setup.group,
            method: setup.method,
            termination: TerminationManager::service(),
            transmission: TransmissionManager::service(
                operation_id,
                setup.remote_subscription,
                config.emission_queue_capacity,
            ),
            expiration: ExpirationManager::new(setup.timeout, config.maximum_timeout),
            protocol: ProtocolManager::service(),
            emission: EmissionManager::service(),
            ingestion: IngestionManager::service(
                setup.local_subscription,
                config.ingestion_window,
                setup.launcher,
            ),
            deferred: Vec::new(),
            shared,
        }
    }

    pub(crate) fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    // ----- Termination -----

    /// Aborts with `outcome` unless already terminated.
    pub(crate) fn abort(&mut self, outcome: Outcome) {
        let Some(terminated) = self.termination.abort(outcome) else {
            return;
        };
        self.transmission.abort(&terminated.outcome);
        self.kick();
        self.on_terminated(terminated);
    }

    pub(crate) fn add_callback(&mut self, callback: TerminationCallback) {
        if let Some((callback, outcome)) = self.termination.add_callback(callback) {
            self.deferred.push(Deferred::Callback(callback, outcome));
        }
    }

    fn settle(&mut self, terminated: Option<Terminated>) {
        if let Some(terminated) = terminated {
            self.on_terminated(terminated);
        }
    }

    fn on_terminated(&mut self, terminated: Terminated) {
        let Terminated { outcome, callbacks } = terminated;
        debug!(
            operation_id = %self.operation_id,
            role = ?self.role,
            outcome = %outcome,
            "operation terminated"
        );
        self.expiration.terminate();
        if outcome.kind == OutcomeKind::Completed {
            self.transmission.terminate();
            self.ingestion.release();
        } else if let Some(task) = self.ingestion.abort(outcome.clone()) {
            task.cancel();
        }
        for callback in callbacks {
            self.deferred.push(Deferred::Callback(callback, outcome.clone()));
        }
    }

    // ----- Transmission -----

    /// Starts the send loop if there is something to send and no loop runs.
    fn kick(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if self.transmission.kick() {
            self.deferred.push(Deferred::Submit(Box::pin(transmit(shared))));
        }
    }

    /// Sends the lead ticket of an invocation and arms its deadline.
    pub(crate) fn kick_off(&mut self, kick_off: KickOff) {
        if kick_off.initial_metadata.is_some()
            || kick_off.payload.is_some()
            || kick_off.completion.is_some()
        {
            self.protocol.begin_handshake();
        }
        let completes = kick_off.completion.is_some();
        self.transmission.kick_off(kick_off);
        self.kick();
        if completes {
            self.emission.terminate();
            let terminated = self.termination.emission_complete();
            self.settle(terminated);
        }
        self.arm_expiration();
    }

    pub(crate) fn ticket_sent(&mut self, completes: bool, result: Result<(), SinkError>) {
        match result {
            Ok(()) if completes => {
                let terminated = self.termination.transmission_complete();
                self.settle(terminated);
            }
            Ok(()) => {}
            Err(err) => {
                warn!(
                    operation_id = %self.operation_id,
                    role = ?self.role,
                    error = %err,
                    "ticket sink failed"
                );
                self.transmission.fail();
                self.abort(Outcome::erroneous(
                    Origin::Local,
                    format!("transmission failure: {err}"),
                ));
            }
        }
    }

    pub(crate) fn allow(&mut self, allowance: u64) {
        self.transmission.allow(allowance);
        self.kick();
    }

    fn grant(&mut self, allowance: u64) {
        if allowance > 0 {
            self.transmission.grant(allowance);
            self.kick();
        }
    }

    // ----- Expiration -----

    pub(crate) fn arm_expiration(&mut self) {
        let timer = self.expiration.arm();
        self.schedule(timer);
    }

    fn schedule(&mut self, timer: Option<Timer>) {
        let Some(timer) = timer else {
            return;
        };
        let shared = self.shared.clone();
        self.deferred.push(Deferred::Submit(Box::pin(async move {
            if !timer.wait().await {
                return;
            }
            if let Some(shared) = shared.upgrade() {
                shared.run(|core| core.managers.expire(&timer.token));
            }
        })));
    }

    fn expire(&mut self, token: &CancellationToken) {
        if self.expiration.expire(token) {
            debug!(operation_id = %self.operation_id, role = ?self.role, "deadline passed");
            self.abort(Outcome::expired(Origin::Local));
        }
    }

    /// Revises the timeout. The invoker also tells the servicer.
    pub(crate) fn change_timeout(&mut self, timeout: Duration) -> bool {
        if !self.termination.is_active() {
            return false;
        }
        let Some(timer) = self.expiration.change_timeout(timeout) else {
            return false;
        };
        if self.role == Role::Invocation {
            if let Some(effective) = self.expiration.timeout() {
                self.transmission.change_timeout(effective);
                self.kick();
            }
        }
        self.schedule(Some(timer));
        true
    }

    // ----- Protocol -----

    pub(crate) fn receive_protocol(&mut self, ticket: &Ticket) {
        if self.protocol.receive(ticket) {
            self.ingestion.notify();
        }
    }

    pub(crate) fn send_initial_metadata(&mut self, metadata: Value) -> Result<(), EmissionError> {
        self.emission.ensure_open()?;
        self.ensure_active()?;
        self.protocol.send_initial_metadata()?;
        self.transmission.send_initial_metadata(metadata);
        self.kick();
        Ok(())
    }

    pub(crate) fn initial_metadata(&self) -> Poll<Result<Option<Value>, IngestionError>> {
        if self.protocol.handshake_received() {
            return Poll::Ready(Ok(self.protocol.remote_metadata().cloned()));
        }
        match self.termination.outcome() {
            Some(outcome) if outcome.kind != OutcomeKind::Completed => {
                Poll::Ready(Err(IngestionError::Aborted(outcome.clone())))
            }
            Some(_) => Poll::Ready(Ok(None)),
            None if self.ingestion.remote_completion().is_some() => Poll::Ready(Ok(None)),
            None => Poll::Pending,
        }
    }

    // ----- Emission -----

    fn ensure_active(&self) -> Result<(), EmissionError> {
        match self.termination.outcome() {
            Some(outcome) => Err(EmissionError::Inactive(outcome.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn emit(&mut self, value: Value) -> Result<Emitted, EmissionError> {
        self.emission.ensure_open()?;
        self.ensure_active()?;
        self.protocol.begin_handshake();
        match self.transmission.offer(value) {
            Ok(()) => {
                self.kick();
                Ok(Emitted::Queued)
            }
            Err(value) => Ok(Emitted::Full(value)),
        }
    }

    pub(crate) fn emit_completion(&mut self, completion: Completion) -> Result<(), EmissionError> {
        self.emission.ensure_open()?;
        self.ensure_active()?;
        self.emission.terminate();
        self.protocol.begin_handshake();
        self.termination.record_local_completion(&completion);
        self.transmission.complete(completion);
        self.kick();
        let terminated = self.termination.emission_complete();
        self.settle(terminated);
        Ok(())
    }

    pub(crate) fn operator_dropped(&mut self) {
        if !self.termination.is_active() {
            self.emission.terminate();
            return;
        }
        match self.emission.abandon(self.ingestion.handler_running()) {
            Abandon::Abort(outcome) => self.abort(outcome),
            Abandon::Defer | Abandon::Nothing => {}
        }
    }

    // ----- Ingestion -----

    /// Launches the service handler and opens the invoker's window unless
    /// the lead ticket already ended the invoker's stream.
    pub(crate) fn start_ingestion(&mut self, open_window: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some((launcher, token)) = self.ingestion.start() else {
            return;
        };
        if open_window {
            let window = self.ingestion.open_window();
            self.grant(window);
        }
        let call = ServiceCall {
            group: self.group.clone(),
            method: self.method.clone(),
            context: OperationContext::new(Arc::clone(&shared)),
            inbound: Inbound::new(Arc::clone(&shared), self.ingestion.ready()),
            operator: Operator::new(Arc::clone(&shared), self.transmission.ready(), false),
        };
        let handler = launcher(call);
        self.deferred.push(Deferred::Submit(Box::pin(serve(shared, handler, token))));
    }

    pub(crate) fn ingest(&mut self, payload: Value) {
        match self.ingestion.consume(payload) {
            Ok(grant) => self.grant(grant),
            Err(violation) => {
                warn!(
                    operation_id = %self.operation_id,
                    role = ?self.role,
                    "flow control violated: {violation}"
                );
                self.abort(Outcome::erroneous(Origin::Local, violation));
            }
        }
    }

    pub(crate) fn remote_completion(&mut self, completion: Completion) {
        self.termination.record_remote_completion(&completion);
        self.ingestion.terminate(completion);
        self.check_ingestion();
    }

    fn check_ingestion(&mut self) {
        if self.ingestion.is_complete() {
            let terminated = self.termination.ingestion_complete();
            self.settle(terminated);
        }
    }

    pub(crate) fn next_inbound(&mut self) -> Poll<Result<Option<Value>, IngestionError>> {
        match self.ingestion.pull() {
            Pulled::Value { value, grant } => {
                self.grant(grant);
                self.check_ingestion();
                Poll::Ready(Ok(Some(value)))
            }
            Pulled::Pending => Poll::Pending,
            Pulled::Finished => {
                self.check_ingestion();
                Poll::Ready(Ok(None))
            }
            Pulled::Aborted(outcome) => Poll::Ready(Err(IngestionError::Aborted(outcome))),
        }
    }

    pub(crate) fn detach_inbound(&mut self) {
        let grant = self.ingestion.detach();
        self.grant(grant);
        self.check_ingestion();
    }

    fn handler_finished(&mut self, result: Result<(), String>) {
        self.ingestion.handler_finished();
        let failure = match result {
            Err(details) => Some(details),
            Ok(()) if self.emission.is_abandoned() => {
                Some("handler returned without terminating its operator".to_string())
            }
            Ok(()) => None,
        };
        if let Some(details) = failure {
            if self.termination.is_active() {
                debug!(
                    operation_id = %self.operation_id,
                    details = %details,
                    "handler failed"
                );
            }
            self.abort(Outcome::erroneous(Origin::Local, details));
        }
    }
}

// ---------------------------------------------------------------------------
// Pool tasks
// ---------------------------------------------------------------------------

/// Drains outbound tickets into the sink, one at a time, off the lock.
///
/// Owns the operation until the queue is empty, so an abort ticket still
/// goes out after every other handle was dropped.
async fn transmit(operation: Arc<Shared>) {
    while let Some(outgoing) = operation.run(|core| core.managers.transmission.next_ticket()) {
        trace!(
            operation_id = %operation.operation_id,
            sequence_number = outgoing.ticket.sequence_number,
            "sending ticket"
        );
        let result = operation.sink.send(outgoing.ticket);
        operation.run(|core| core.managers.ticket_sent(outgoing.completes, result));
    }
}

/// Runs the service handler until it returns or the operation aborts.
///
/// The handler is polled before the cancellation branch, so a handler
/// blocked on a read observes the abort error before being dropped.
async fn serve(
    shared: Arc<Shared>,
    handler: BoxFuture<'static, anyhow::Result<()>>,
    token: CancellationToken,
) {
    if token.is_cancelled() {
        return;
    }
    let mut handler = AssertUnwindSafe(handler).catch_unwind();
    let finished = tokio::select! {
        biased;
        result = &mut handler => Some(result),
        () = token.cancelled() => None,
    };
    let Some(result) = finished else {
        return;
    };
    let report = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    };
    shared.run(|core| core.managers.handler_finished(report));
    drop(handler);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        return "handler panicked".to_string();
    };
    format!("handler panicked: {message}")
}
