//! Termination bookkeeping: whether the operation is still active, how it
//! ended, and who is told about it.
//!
//! An operation terminates exactly once, either naturally (every completion
//! requirement satisfied) or by abort. Whichever happens first wins; later
//! signals and aborts are no-ops.

use courier_core::{Completion, Outcome};
use tokio::sync::watch;

use crate::operation::Role;

/// Callback fired once with the operation's outcome.
pub(crate) type TerminationCallback = Box<dyn FnOnce(&Outcome) + Send>;

/// Result of the transition to terminated: the recorded outcome and the
/// callbacks that must now run (outside the operation lock).
pub(crate) struct Terminated {
    pub(crate) outcome: Outcome,
    pub(crate) callbacks: Vec<TerminationCallback>,
}

pub(crate) struct TerminationManager {
    role: Role,
    emission_pending: bool,
    transmission_pending: bool,
    ingestion_pending: bool,
    /// Status reported in a `Completed` outcome.
    status: Option<Completion>,
    outcome: Option<Outcome>,
    callbacks: Vec<TerminationCallback>,
    outcome_tx: watch::Sender<Option<Outcome>>,
}

impl TerminationManager {
    /// Invoker side: the completed outcome reports the servicer's status.
    pub(crate) fn invocation() -> Self {
        Self::new(Role::Invocation)
    }

    /// Service side: the completed outcome reports the handler's own status.
    pub(crate) fn service() -> Self {
        Self::new(Role::Service)
    }

    fn new(role: Role) -> Self {
        let (outcome_tx, _rx) = watch::channel(None);
        Self {
            role,
            emission_pending: true,
            transmission_pending: true,
            ingestion_pending: true,
            status: None,
            outcome: None,
            callbacks: Vec::new(),
            outcome_tx,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.outcome.is_none()
    }

    pub(crate) fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Receiver resolved with the outcome once the operation terminates.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Outcome>> {
        self.outcome_tx.subscribe()
    }

    /// Registers `callback`. If the operation already terminated, the
    /// callback is handed back together with the outcome to run right away.
    pub(crate) fn add_callback(
        &mut self,
        callback: TerminationCallback,
    ) -> Option<(TerminationCallback, Outcome)> {
        match &self.outcome {
            Some(outcome) => Some((callback, outcome.clone())),
            None => {
                self.callbacks.push(callback);
                None
            }
        }
    }

    /// Records the completion this side emitted.
    pub(crate) fn record_local_completion(&mut self, completion: &Completion) {
        if self.role == Role::Service && self.is_active() {
            self.status = Some(completion.clone());
        }
    }

    /// Records the completion the peer sent.
    pub(crate) fn record_remote_completion(&mut self, completion: &Completion) {
        if self.role == Role::Invocation && self.is_active() {
            self.status = Some(completion.clone());
        }
    }

    pub(crate) fn emission_complete(&mut self) -> Option<Terminated> {
        self.emission_pending = false;
        self.try_complete()
    }

    pub(crate) fn transmission_complete(&mut self) -> Option<Terminated> {
        self.transmission_pending = false;
        self.try_complete()
    }

    pub(crate) fn ingestion_complete(&mut self) -> Option<Terminated> {
        self.ingestion_pending = false;
        self.try_complete()
    }

    /// Forces termination with `outcome` unless already terminated.
    pub(crate) fn abort(&mut self, outcome: Outcome) -> Option<Terminated> {
        if self.is_active() {
            Some(self.terminate(outcome))
        } else {
            None
        }
    }

    fn try_complete(&mut self) -> Option<Terminated> {
        if !self.is_active()
            || self.emission_pending
            || self.transmission_pending
            || self.ingestion_pending
        {
            return None;
        }
        let outcome = Outcome::completed(self.status.as_ref());
        Some(self.terminate(outcome))
    }

    fn terminate(&mut self, outcome: Outcome) -> Terminated {
        self.outcome = Some(outcome.clone());
        self.outcome_tx.send_replace(Some(outcome.clone()));
        Terminated {
            outcome,
            callbacks: std::mem::take(&mut self.callbacks),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use courier_core::{Code, Origin, OutcomeKind};

    use super::*;

    fn counting_callback(counter: &Arc<AtomicU32>) -> TerminationCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn fire(terminated: Terminated) {
        for callback in terminated.callbacks {
            callback(&terminated.outcome);
        }
    }

    #[test]
    fn completes_only_after_all_requirements() {
        let mut manager = TerminationManager::service();
        assert!(manager.emission_complete().is_none());
        assert!(manager.ingestion_complete().is_none());
        assert!(manager.is_active());

        let terminated = manager.transmission_complete().unwrap();
        assert_eq!(terminated.outcome.kind, OutcomeKind::Completed);
        assert!(!manager.is_active());
    }

    #[test]
    fn requirement_order_does_not_matter() {
        let mut manager = TerminationManager::invocation();
        assert!(manager.ingestion_complete().is_none());
        assert!(manager.transmission_complete().is_none());
        assert!(manager.emission_complete().is_some());
    }

    #[test]
    fn repeated_signal_is_harmless() {
        let mut manager = TerminationManager::service();
        assert!(manager.emission_complete().is_none());
        assert!(manager.emission_complete().is_none());
        assert!(manager.is_active());
    }

    #[test]
    fn first_abort_wins() {
        let mut manager = TerminationManager::invocation();
        let first = manager.abort(Outcome::expired(Origin::Local)).unwrap();
        assert_eq!(first.outcome.kind, OutcomeKind::Expired);

        assert!(manager.abort(Outcome::cancelled(Origin::Local)).is_none());
        assert_eq!(manager.outcome().unwrap().kind, OutcomeKind::Expired);
    }

    #[test]
    fn signals_after_termination_are_noops() {
        let mut manager = TerminationManager::service();
        manager.abort(Outcome::cancelled(Origin::Remote)).unwrap();
        assert!(manager.emission_complete().is_none());
        assert!(manager.transmission_complete().is_none());
        assert!(manager.ingestion_complete().is_none());
        assert_eq!(manager.outcome().unwrap().kind, OutcomeKind::Cancelled);
    }

    #[test]
    fn callbacks_fire_exactly_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut manager = TerminationManager::service();
        assert!(manager.add_callback(counting_callback(&counter)).is_none());
        assert!(manager.add_callback(counting_callback(&counter)).is_none());

        fire(manager.abort(Outcome::cancelled(Origin::Local)).unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(manager.abort(Outcome::cancelled(Origin::Local)).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_callback_is_returned_for_immediate_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut manager = TerminationManager::invocation();
        manager.abort(Outcome::cancelled(Origin::Local)).unwrap();

        let (callback, outcome) = manager.add_callback(counting_callback(&counter)).unwrap();
        callback(&outcome);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.kind, OutcomeKind::Cancelled);
    }

    #[test]
    fn invocation_reports_remote_status() {
        let mut manager = TerminationManager::invocation();
        manager.record_local_completion(&Completion::default());
        manager.record_remote_completion(&Completion::with_status(Code(5), "missing"));
        manager.emission_complete();
        manager.transmission_complete();
        let terminated = manager.ingestion_complete().unwrap();
        assert_eq!(terminated.outcome.code, Some(Code(5)));
        assert_eq!(terminated.outcome.details.as_deref(), Some("missing"));
    }

    #[test]
    fn service_reports_local_status() {
        let mut manager = TerminationManager::service();
        manager.record_remote_completion(&Completion::default());
        manager.record_local_completion(&Completion::ok());
        manager.emission_complete();
        manager.ingestion_complete();
        let terminated = manager.transmission_complete().unwrap();
        assert_eq!(terminated.outcome.code, Some(Code::OK));
    }

    #[tokio::test]
    async fn subscriber_observes_outcome() {
        let mut manager = TerminationManager::service();
        let mut rx = manager.subscribe();
        assert!(rx.borrow().is_none());

        manager.abort(Outcome::expired(Origin::Local)).unwrap();
        let outcome = rx.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(outcome.unwrap().kind, OutcomeKind::Expired);
    }
}
