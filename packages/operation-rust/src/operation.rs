//! The operation facade and its two construction entry points.
//!
//! The invoker creates its operation eagerly and speaks first. The
//! servicer's operation is created from the first inbound ticket of a call.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    Completion, OperationId, Origin, Outcome, OutcomeKind, Subscription, Ticket, Value,
};
use tracing::debug;

use crate::config::OperationConfig;
use crate::context::OperationContext;
use crate::emission::Operator;
use crate::error::ServiceError;
use crate::ingestion::Inbound;
use crate::managers::{Managers, OperationCore, ServiceSetup, Shared};
use crate::pool::Pool;
use crate::servicer::{self, Servicer};
use crate::sink::TicketSink;
use crate::transmission::KickOff;

/// Which side of the call an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The calling side.
    Invocation,
    /// The serving side.
    Service,
}

/// Everything the lead ticket of an invocation carries.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    pub group: String,
    pub method: String,
    pub subscription: Subscription,
    /// Requested timeout; the configured default applies when `None`.
    pub timeout: Option<Duration>,
    pub protocol_options: Option<Value>,
    pub initial_metadata: Option<Value>,
    /// A first value sent along with the lead ticket.
    pub payload: Option<Value>,
    /// Set to end the invoker's stream on the lead ticket itself.
    pub completion: Option<Completion>,
}

impl InvocationRequest {
    #[must_use]
    pub fn new(group: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// A request sending `payload` and completing on the lead ticket.
    #[must_use]
    pub fn unary(group: impl Into<String>, method: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            completion: Some(Completion::default()),
            ..Self::new(group, method)
        }
    }
}

/// The invoker's handles onto a started call.
#[derive(Debug)]
pub struct Invocation {
    pub operation: Operation,
    pub context: OperationContext,
    pub operator: Operator,
    pub inbound: Inbound,
}

/// Transport-facing handle of one operation.
#[derive(Clone)]
pub struct Operation {
    shared: Arc<Shared>,
}

impl Operation {
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.shared.operation_id()
    }

    /// Feeds one inbound ticket to the operation.
    pub fn handle_ticket(&self, ticket: Ticket) {
        self.shared.run(|core| core.handle_ticket(ticket));
    }

    /// Aborts the operation with a locally decided outcome. The first
    /// termination wins; later aborts are no-ops.
    pub fn abort(&self, kind: OutcomeKind) {
        let outcome = Outcome::new(kind, Origin::Local);
        self.shared.run(|core| core.managers.abort(outcome));
    }

    #[must_use]
    pub fn context(&self) -> OperationContext {
        OperationContext::new(Arc::clone(&self.shared))
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("operation_id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Starts an invocation: the lead ticket is queued for transmission and
/// the deadline armed before this returns.
#[must_use]
pub fn invocation_operate(
    request: InvocationRequest,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
    config: &OperationConfig,
) -> Invocation {
    invocation_operate_with(request, sink, pool, config, |_| {})
}

/// Like [`invocation_operate`], handing the operation to `on_created`
/// before the lead ticket can reach the sink.
pub(crate) fn invocation_operate_with(
    request: InvocationRequest,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
    config: &OperationConfig,
    on_created: impl FnOnce(&Operation),
) -> Invocation {
    let operation_id = OperationId::generate();
    let timeout = config.effective_timeout(request.timeout);
    let shared = Shared::new(operation_id, sink, pool, |weak| {
        let managers = Managers::invocation(
            operation_id,
            request.subscription,
            request.protocol_options.clone(),
            timeout,
            config,
            weak,
        );
        OperationCore::new(managers, config)
    });
    debug!(
        operation_id = %operation_id,
        group = %request.group,
        method = %request.method,
        "invocation created"
    );
    let operation = Operation {
        shared: Arc::clone(&shared),
    };
    on_created(&operation);

    let completes = request.completion.is_some();
    let kick_off = KickOff {
        group: request.group,
        method: request.method,
        subscription: request.subscription,
        timeout,
        protocol_options: request.protocol_options,
        initial_metadata: request.initial_metadata,
        payload: request.payload,
        completion: request.completion,
        allowance: config.ingestion_window,
    };
    let (operator_ready, inbound_ready) = shared.run(|core| {
        core.managers.kick_off(kick_off);
        (
            core.managers.transmission.ready(),
            core.managers.ingestion.ready(),
        )
    });

    Invocation {
        operation,
        context: OperationContext::new(Arc::clone(&shared)),
        operator: Operator::new(Arc::clone(&shared), operator_ready, completes),
        inbound: Inbound::new(shared, inbound_ready),
    }
}

/// Creates the service side of a call from its lead ticket and processes
/// that ticket, launching `servicer` on the pool.
///
/// # Errors
///
/// Returns [`ServiceError::NotLead`] if `first` does not open a call.
pub fn service_operate(
    first: Ticket,
    servicer: Arc<dyn Servicer>,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
    config: &OperationConfig,
) -> Result<Operation, ServiceError> {
    service_operate_with(first, servicer, sink, pool, config, |_| {})
}

/// Like [`service_operate`], handing the operation to `on_created` before
/// the lead ticket is processed and the handler launched.
pub(crate) fn service_operate_with(
    first: Ticket,
    servicer: Arc<dyn Servicer>,
    sink: Arc<dyn TicketSink>,
    pool: Arc<dyn Pool>,
    config: &OperationConfig,
    on_created: impl FnOnce(&Operation),
) -> Result<Operation, ServiceError> {
    let (Some(group), Some(method), 0) = (
        first.group.clone(),
        first.method.clone(),
        first.sequence_number,
    ) else {
        return Err(ServiceError::NotLead {
            sequence_number: first.sequence_number,
        });
    };
    let operation_id = first.operation_id;
    let setup = ServiceSetup {
        local_subscription: servicer.subscription(&group, &method),
        remote_subscription: first.subscription.unwrap_or_default(),
        timeout: config.effective_timeout(first.timeout),
        launcher: Box::new(servicer::launch(servicer)),
        group,
        method,
    };
    debug!(
        operation_id = %operation_id,
        group = %setup.group,
        method = %setup.method,
        "service operation created"
    );
    let shared = Shared::new(operation_id, sink, pool, |weak| {
        OperationCore::new(Managers::service(operation_id, setup, config, weak), config)
    });
    let operation = Operation { shared };
    on_created(&operation);
    operation.shared.run(|core| {
        core.managers.arm_expiration();
        core.handle_ticket(first);
    });
    Ok(operation)
}
