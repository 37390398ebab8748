//! Deadline tracking.
//!
//! The deadline is always `start + timeout`: revising the timeout re-arms the
//! timer relative to when the operation started, not relative to now. Once
//! the deadline fires it stays fired.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One armed deadline timer. Superseded timers are cancelled through their
/// token, and a timer only counts if its token is still live when it fires.
#[derive(Debug, Clone)]
pub(crate) struct Timer {
    pub(crate) deadline: Instant,
    pub(crate) token: CancellationToken,
}

impl Timer {
    /// Waits for the deadline. Returns `false` if the timer was cancelled.
    pub(crate) async fn wait(&self) -> bool {
        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => true,
            () = self.token.cancelled() => false,
        }
    }
}

pub(crate) struct ExpirationManager {
    started: Instant,
    timeout: Option<Duration>,
    maximum: Option<Duration>,
    fired: bool,
    terminated: bool,
    timer: Option<CancellationToken>,
}

impl ExpirationManager {
    /// `timeout` is the already-resolved timeout; `None` never expires.
    pub(crate) fn new(timeout: Option<Duration>, maximum: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            maximum,
            fired: false,
            terminated: false,
            timer: None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.started + timeout)
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn time_remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Arms a timer for the current deadline, cancelling any previous one.
    pub(crate) fn arm(&mut self) -> Option<Timer> {
        if self.fired || self.terminated {
            return None;
        }
        if let Some(previous) = self.timer.take() {
            previous.cancel();
        }
        let deadline = self.deadline()?;
        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        Some(Timer { deadline, token })
    }

    /// Revises the timeout. Ignored once the deadline fired.
    pub(crate) fn change_timeout(&mut self, timeout: Duration) -> Option<Timer> {
        if self.fired || self.terminated {
            return None;
        }
        self.timeout = Some(self.maximum.map_or(timeout, |maximum| timeout.min(maximum)));
        self.arm()
    }

    /// Called when a timer elapses. Returns `true` if the operation must
    /// now expire.
    pub(crate) fn expire(&mut self, token: &CancellationToken) -> bool {
        // `arm` cancels every superseded token, so an uncancelled one is live.
        if self.fired || self.terminated || token.is_cancelled() || self.timer.is_none() {
            return false;
        }
        self.fired = true;
        self.timer = None;
        true
    }

    /// Cancels the timer once the operation terminated.
    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
