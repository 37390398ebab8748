//! Customer-facing view of a running operation.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{OperationId, Origin, Outcome, Value};
use tokio::time::Instant;

use crate::managers::Shared;

/// Read-mostly handle onto one operation: its liveness, outcome and
/// deadline, plus the controls customer code may use to end it early.
///
/// Cheap to clone; every clone refers to the same operation.
#[derive(Clone)]
pub struct OperationContext {
    shared: Arc<Shared>,
}

impl OperationContext {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        self.shared.operation_id()
    }

    /// Whether the operation has not yet terminated.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.run(|core| core.managers.termination.is_active())
    }

    /// Registers `callback` to run once with the outcome. Runs it right away
    /// if the operation already terminated.
    ///
    /// Callbacks run outside the operation lock and may use this context.
    pub fn add_callback(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        self.shared.run(|core| core.managers.add_callback(Box::new(callback)));
    }

    /// The outcome, if the operation already terminated.
    #[must_use]
    pub fn outcome_now(&self) -> Option<Outcome> {
        self.shared.run(|core| core.managers.termination.outcome().cloned())
    }

    /// Waits for the operation to terminate and returns its outcome.
    pub async fn outcome(&self) -> Outcome {
        let mut rx = self.shared.run(|core| core.managers.termination.subscribe());
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());
        // The sender belongs to the operation this context keeps alive.
        outcome.unwrap_or_else(|| Outcome::cancelled(Origin::Local))
    }

    /// The absolute deadline, or `None` when the call never expires.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.run(|core| core.managers.expiration.deadline())
    }

    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.shared.run(|core| core.managers.expiration.time_remaining())
    }

    /// Revises the timeout, measured from the start of the operation.
    ///
    /// On the invoking side the new timeout is also sent to the servicer.
    /// Returns `false` once the deadline fired or the operation ended.
    pub fn change_timeout(&self, timeout: Duration) -> bool {
        self.shared.run(|core| core.managers.change_timeout(timeout))
    }

    /// Cancels the operation. No-op once terminated.
    pub fn cancel(&self) {
        self.shared.run(|core| core.managers.abort(Outcome::cancelled(Origin::Local)));
    }

    /// Aborts the operation as erroneous. No-op once terminated.
    pub fn fail(&self, details: impl Into<String>) {
        let outcome = Outcome::erroneous(Origin::Local, details);
        self.shared.run(|core| core.managers.abort(outcome));
    }

    /// Protocol options sent by the invoker.
    #[must_use]
    pub fn protocol_options(&self) -> Option<Value> {
        self.shared.run(|core| core.managers.protocol.protocol_options().cloned())
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_id", &self.shared.operation_id())
            .finish_non_exhaustive()
    }
}
