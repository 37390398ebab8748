//! The customer-facing emission sink.
//!
//! [`Operator`] is how customer code produces outbound values. It takes
//! `&mut self`, so one writer at a time is enforced by the borrow checker;
//! the bookkeeping lives in [`EmissionManager`] under the operation lock.

use std::pin::pin;
use std::sync::Arc;

use courier_core::{Completion, Origin, Outcome, Value};
use tokio::sync::Notify;

use crate::error::EmissionError;
use crate::managers::Shared;
use crate::operation::Role;

/// Emission state shared with the rest of the managers.
pub(crate) struct EmissionManager {
    role: Role,
    terminated: bool,
    /// The operator was dropped unterminated while the handler still ran.
    abandoned: bool,
}

/// What dropping an unterminated operator should do.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Abandon {
    Nothing,
    /// Abort the operation now with this outcome.
    Abort(Outcome),
    /// Let the running handler's result decide.
    Defer,
}

impl EmissionManager {
    pub(crate) fn invocation() -> Self {
        Self::new(Role::Invocation)
    }

    pub(crate) fn service() -> Self {
        Self::new(Role::Service)
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            terminated: false,
            abandoned: false,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), EmissionError> {
        if self.terminated {
            Err(EmissionError::AlreadyTerminated)
        } else {
            Ok(())
        }
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// The completion sent by a plain `terminate`.
    pub(crate) fn default_completion(&self) -> Completion {
        match self.role {
            Role::Invocation => Completion::default(),
            Role::Service => Completion::ok(),
        }
    }

    /// Decides what an unterminated operator's drop means.
    pub(crate) fn abandon(&mut self, handler_running: bool) -> Abandon {
        if self.terminated {
            return Abandon::Nothing;
        }
        self.terminated = true;
        match self.role {
            Role::Invocation => Abandon::Abort(Outcome::cancelled(Origin::Local)),
            Role::Service if handler_running => {
                self.abandoned = true;
                Abandon::Defer
            }
            Role::Service => Abandon::Abort(Outcome::erroneous(
                Origin::Local,
                "operator dropped without terminating",
            )),
        }
    }
}

/// Outcome of offering one value to transmission.
#[derive(Debug)]
pub(crate) enum Emitted {
    Queued,
    /// The outbound queue is full; the value is handed back.
    Full(Value),
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Emits this side's values and completion.
///
/// Dropping an operator that was never terminated aborts the call: the
/// invoker cancels it, a service reports it as erroneous.
pub struct Operator {
    shared: Arc<Shared>,
    ready: Arc<Notify>,
    terminated: bool,
}

impl Operator {
    pub(crate) fn new(shared: Arc<Shared>, ready: Arc<Notify>, terminated: bool) -> Self {
        Self {
            shared,
            ready,
            terminated,
        }
    }

    /// Emits one value, waiting while the outbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`EmissionError::AlreadyTerminated`] after `terminate`, or
    /// [`EmissionError::Inactive`] once the operation has ended.
    pub async fn consume(&mut self, value: Value) -> Result<(), EmissionError> {
        let mut value = value;
        loop {
            let mut notified = pin!(self.ready.notified());
            notified.as_mut().enable();
            match self.shared.run(|core| core.managers.emit(value))? {
                Emitted::Queued => return Ok(()),
                Emitted::Full(returned) => {
                    value = returned;
                    notified.await;
                }
            }
        }
    }

    /// Signals that no more values follow, with this side's default status.
    ///
    /// # Errors
    ///
    /// Same as [`Operator::terminate_with`].
    pub fn terminate(&mut self) -> Result<(), EmissionError> {
        let completion = self.shared.run(|core| core.managers.emission.default_completion());
        self.terminate_with(completion)
    }

    /// Signals that no more values follow, carrying `completion`.
    ///
    /// # Errors
    ///
    /// Returns [`EmissionError::AlreadyTerminated`] when called twice, or
    /// [`EmissionError::Inactive`] once the operation has ended.
    pub fn terminate_with(&mut self, completion: Completion) -> Result<(), EmissionError> {
        let result = self.shared.run(|core| core.managers.emit_completion(completion));
        if !matches!(result, Err(EmissionError::Inactive(_))) {
            self.terminated = true;
        }
        result
    }

    /// Emits a final value and terminates.
    ///
    /// # Errors
    ///
    /// Same as [`Operator::consume`] and [`Operator::terminate`].
    pub async fn consume_and_terminate(&mut self, value: Value) -> Result<(), EmissionError> {
        self.consume(value).await?;
        self.terminate()
    }

    /// Sends initial metadata ahead of the first value or completion.
    ///
    /// # Errors
    ///
    /// Returns [`EmissionError::MetadataTooLate`] once a value, completion or
    /// metadata was already emitted.
    pub fn send_initial_metadata(&mut self, metadata: Value) -> Result<(), EmissionError> {
        self.shared.run(|core| core.managers.send_initial_metadata(metadata))
    }

    /// Whether this operator was terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for Operator {
    fn drop(&mut self) {
        if !self.terminated {
            self.shared.run(|core| core.managers.operator_dropped());
        }
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("operation_id", &self.shared.operation_id())
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
