//! Inbound value delivery and the customer-code task.
//!
//! Inbound payloads are buffered here until customer code pulls them through
//! [`Inbound`]. Consumption refills the peer's allowance one value at a
//! time, so the buffer never holds more than the advertised window.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;

use courier_core::{Completion, Outcome, Subscription, Value};
use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::IngestionError;
use crate::managers::Shared;
use crate::servicer::ServiceCall;

/// Builds the customer handler future once the call is ready to start.
pub(crate) type Launcher =
    Box<dyn FnOnce(ServiceCall) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    NotStarted,
    Running,
    Terminated,
}

/// Result of one pull from the inbound buffer.
#[derive(Debug)]
pub(crate) enum Pulled {
    /// A value, plus the allowance to hand back to the peer for it.
    Value { value: Value, grant: u64 },
    Pending,
    Finished,
    Aborted(Outcome),
}

pub(crate) struct IngestionManager {
    stage: Stage,
    subscription: Subscription,
    buffer: VecDeque<Value>,
    remote_completion: Option<Completion>,
    attached: bool,
    credit: u64,
    window: u64,
    aborted: Option<Outcome>,
    ready: Arc<Notify>,
    launcher: Option<Launcher>,
    task: Option<CancellationToken>,
    handler_running: bool,
}

impl IngestionManager {
    /// Invoker side: customer code is the caller itself, so ingestion runs
    /// from the start with the window advertised on the lead ticket.
    pub(crate) fn invocation(subscription: Subscription, window: u64) -> Self {
        let mut manager = Self::new(subscription, window, None);
        manager.stage = Stage::Running;
        manager.credit = window;
        manager
    }

    /// Service side: the handler is launched when the lead ticket arrives.
    /// The invoker may send one payload before any grant.
    pub(crate) fn service(subscription: Subscription, window: u64, launcher: Launcher) -> Self {
        let mut manager = Self::new(subscription, window, Some(launcher));
        manager.credit = 1;
        manager
    }

    fn new(subscription: Subscription, window: u64, launcher: Option<Launcher>) -> Self {
        Self {
            stage: Stage::NotStarted,
            subscription,
            buffer: VecDeque::new(),
            remote_completion: None,
            attached: true,
            credit: 0,
            window: window.max(1),
            aborted: None,
            ready: Arc::new(Notify::new()),
            launcher,
            task: None,
            handler_running: false,
        }
    }

    /// Notified whenever a value, the handshake, completion or abort arrives.
    pub(crate) fn ready(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    pub(crate) fn notify(&self) {
        self.ready.notify_waiters();
    }

    /// Moves to running and hands out the launcher with the token that
    /// cancels the customer task on abort.
    pub(crate) fn start(&mut self) -> Option<(Launcher, CancellationToken)> {
        if self.stage != Stage::NotStarted {
            return None;
        }
        self.stage = Stage::Running;
        let launcher = self.launcher.take()?;
        let token = CancellationToken::new();
        self.task = Some(token.clone());
        self.handler_running = true;
        Some((launcher, token))
    }

    /// Extends credit by one full window. Returns the grant to transmit.
    pub(crate) fn open_window(&mut self) -> u64 {
        self.credit += self.window;
        self.window
    }

    pub(crate) fn handler_running(&self) -> bool {
        self.handler_running
    }

    pub(crate) fn handler_finished(&mut self) {
        self.handler_running = false;
        self.task = None;
    }

    /// Accepts one inbound payload. Returns the allowance to hand straight
    /// back when the value is discarded, or an error when the peer sent
    /// more than it was granted.
    pub(crate) fn consume(&mut self, payload: Value) -> Result<u64, &'static str> {
        if self.stage == Stage::Terminated || self.remote_completion.is_some() {
            return Ok(0);
        }
        if self.credit == 0 {
            return Err("payload received without allowance");
        }
        self.credit -= 1;
        if self.attached && self.subscription.wants_values() {
            self.buffer.push_back(payload);
            self.ready.notify_waiters();
            Ok(0)
        } else {
            Ok(self.refill(1))
        }
    }

    pub(crate) fn pull(&mut self) -> Pulled {
        if let Some(outcome) = &self.aborted {
            return Pulled::Aborted(outcome.clone());
        }
        if let Some(value) = self.buffer.pop_front() {
            let grant = self.refill(1);
            return Pulled::Value { value, grant };
        }
        if self.remote_completion.is_some() || self.stage == Stage::Terminated {
            Pulled::Finished
        } else {
            Pulled::Pending
        }
    }

    /// Credit returned to the peer for `consumed` values. Nothing is handed
    /// back once the peer finished sending.
    fn refill(&mut self, consumed: u64) -> u64 {
        if self.remote_completion.is_some() || self.stage == Stage::Terminated {
            return 0;
        }
        self.credit += consumed;
        consumed
    }

    /// Records end-of-input.
    pub(crate) fn terminate(&mut self, completion: Completion) {
        if self.remote_completion.is_none() {
            self.remote_completion = Some(completion);
            self.ready.notify_waiters();
        }
    }

    pub(crate) fn remote_completion(&self) -> Option<&Completion> {
        self.remote_completion.as_ref()
    }

    /// Whether every inbound value has arrived and been consumed.
    pub(crate) fn is_complete(&self) -> bool {
        self.remote_completion.is_some() && self.buffer.is_empty()
    }

    /// Customer code stopped reading: drop what is buffered and keep the
    /// allowance flowing. Returns the grant for the dropped values.
    pub(crate) fn detach(&mut self) -> u64 {
        if !self.attached {
            return 0;
        }
        self.attached = false;
        let dropped = self.buffer.len() as u64;
        self.buffer.clear();
        self.refill(dropped)
    }

    /// Closes ingestion with an error visible to every pending read.
    /// Returns the token of the customer task so the caller can cancel it.
    pub(crate) fn abort(&mut self, outcome: Outcome) -> Option<CancellationToken> {
        self.stage = Stage::Terminated;
        self.aborted = Some(outcome);
        self.buffer.clear();
        self.launcher = None;
        self.ready.notify_waiters();
        self.task.take()
    }

    /// Closes ingestion after natural termination. The customer task is
    /// left to finish on its own.
    pub(crate) fn release(&mut self) {
        self.stage = Stage::Terminated;
        self.launcher = None;
        self.ready.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Customer-facing reader of the values the peer sends.
///
/// Dropping the reader detaches it: later payloads are discarded while the
/// peer's allowance keeps being refilled, so the call can still complete.
pub struct Inbound {
    shared: Arc<Shared>,
    ready: Arc<Notify>,
}

impl Inbound {
    pub(crate) fn new(shared: Arc<Shared>, ready: Arc<Notify>) -> Self {
        Self { shared, ready }
    }

    /// Waits for the next inbound value.
    ///
    /// Returns `Ok(None)` once the peer completed and every value was read.
    ///
    /// # Errors
    ///
    /// Returns [`IngestionError::Aborted`] if the operation was aborted.
    pub async fn next(&mut self) -> Result<Option<Value>, IngestionError> {
        loop {
            let mut notified = pin!(self.ready.notified());
            notified.as_mut().enable();
            match self.shared.run(|core| core.managers.next_inbound()) {
                Poll::Ready(result) => return result,
                Poll::Pending => notified.await,
            }
        }
    }

    /// Waits for the peer's handshake and returns its initial metadata.
    ///
    /// # Errors
    ///
    /// Returns [`IngestionError::Aborted`] if the operation was aborted
    /// before the handshake arrived.
    pub async fn initial_metadata(&mut self) -> Result<Option<Value>, IngestionError> {
        loop {
            let mut notified = pin!(self.ready.notified());
            notified.as_mut().enable();
            match self.shared.run(|core| core.managers.initial_metadata()) {
                Poll::Ready(result) => return result,
                Poll::Pending => notified.await,
            }
        }
    }

    /// The completion the peer sent, once it arrived.
    #[must_use]
    pub fn completion(&self) -> Option<Completion> {
        self.shared.run(|core| core.managers.ingestion.remote_completion().cloned())
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.shared.run(|core| core.managers.detach_inbound());
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("operation_id", &self.shared.operation_id())
            .finish_non_exhaustive()
    }
}
