//! Helpers shared by the in-crate tests.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::task::Context;
use std::time::Duration;

use courier_core::{Completion, OperationId, Outcome, Subscription, Termination, Ticket, Value};
use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::OperationConfig;
use crate::context::OperationContext;
use crate::end::End;
use crate::error::SinkError;
use crate::pool::{Pool, Task, TokioPool};
use crate::servicer::Servicer;
use crate::sink::TicketSink;

pub(crate) fn pool() -> Arc<dyn Pool> {
    Arc::new(TokioPool::current())
}

/// A sink whose tickets can be read back.
pub(crate) fn wire() -> (Arc<dyn TicketSink>, mpsc::UnboundedReceiver<Ticket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Receives the next ticket, failing the test after one second.
pub(crate) async fn recv(rx: &mut mpsc::UnboundedReceiver<Ticket>) -> Ticket {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a ticket")
        .expect("wire closed")
}

/// Awaits `future`, failing the test after five seconds.
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Waits for the outcome of the operation behind `context`.
pub(crate) async fn settled(context: &OperationContext) -> Outcome {
    within(context.outcome()).await
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Lead ticket of an `echo/Say` call.
pub(crate) fn lead(operation_id: OperationId) -> Ticket {
    let mut ticket = Ticket::new(operation_id, 0);
    ticket.group = Some("echo".to_string());
    ticket.method = Some("Say".to_string());
    ticket.subscription = Some(Subscription::Full);
    ticket
}

pub(crate) fn payload(operation_id: OperationId, sequence_number: u64, value: Value) -> Ticket {
    let mut ticket = Ticket::new(operation_id, sequence_number);
    ticket.payload = Some(value);
    ticket
}

pub(crate) fn completion(operation_id: OperationId, sequence_number: u64) -> Ticket {
    let mut ticket = Ticket::new(operation_id, sequence_number);
    ticket.termination = Termination::Completion(Completion::default());
    ticket
}

/// Two ends joined by in-process channels. Every ticket crossing the link
/// is recorded in order.
pub(crate) struct Link {
    pub(crate) client: End,
    pub(crate) server: End,
    pub(crate) to_server: Arc<Mutex<Vec<Ticket>>>,
    pub(crate) to_client: Arc<Mutex<Vec<Ticket>>>,
}

pub(crate) fn link(servicer: Arc<dyn Servicer>, config: OperationConfig) -> Link {
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Ticket>();
    let (server_tx, server_rx) = mpsc::unbounded_channel::<Ticket>();
    let client = End::new(config.clone(), Arc::new(client_tx), pool(), None);
    let server = End::new(config, Arc::new(server_tx), pool(), Some(servicer));
    let to_server = Arc::new(Mutex::new(Vec::new()));
    let to_client = Arc::new(Mutex::new(Vec::new()));
    pump(client_rx, server.clone(), Arc::clone(&to_server));
    pump(server_rx, client.clone(), Arc::clone(&to_client));
    Link {
        client,
        server,
        to_server,
        to_client,
    }
}

fn pump(mut rx: mpsc::UnboundedReceiver<Ticket>, to: End, log: Arc<Mutex<Vec<Ticket>>>) {
    tokio::spawn(async move {
        while let Some(ticket) = rx.recv().await {
            log.lock().push(ticket.clone());
            to.receive_ticket(ticket);
        }
    });
}

/// Runs each task on the submitting thread until it first suspends; only
/// the remainder is spawned.
pub(crate) struct InlinePool;

impl Pool for InlinePool {
    fn submit(&self, mut task: Task) {
        let mut cx = Context::from_waker(noop_waker_ref());
        if task.as_mut().poll(&mut cx).is_pending() {
            tokio::spawn(task);
        }
    }
}

/// Sink handing every ticket straight to the peer end, on the caller's
/// stack.
struct Direct {
    peer: OnceLock<End>,
    log: Arc<Mutex<Vec<Ticket>>>,
}

impl TicketSink for Direct {
    fn send(&self, ticket: Ticket) -> Result<(), SinkError> {
        let peer = self.peer.get().ok_or(SinkError::Disconnected)?;
        self.log.lock().push(ticket.clone());
        peer.receive_ticket(ticket);
        Ok(())
    }
}

/// Two ends joined without channels or spawned pumps: sending a ticket
/// runs the peer's reception, and pool tasks start inline.
pub(crate) fn inline_link(servicer: Arc<dyn Servicer>, config: OperationConfig) -> Link {
    let to_server = Arc::new(Mutex::new(Vec::new()));
    let to_client = Arc::new(Mutex::new(Vec::new()));
    let client_sink = Arc::new(Direct {
        peer: OnceLock::new(),
        log: Arc::clone(&to_server),
    });
    let server_sink = Arc::new(Direct {
        peer: OnceLock::new(),
        log: Arc::clone(&to_client),
    });
    let client = End::new(
        config.clone(),
        Arc::clone(&client_sink) as Arc<dyn TicketSink>,
        Arc::new(InlinePool),
        None,
    );
    let server = End::new(
        config,
        Arc::clone(&server_sink) as Arc<dyn TicketSink>,
        Arc::new(InlinePool),
        Some(servicer),
    );
    let _ = client_sink.peer.set(server.clone());
    let _ = server_sink.peer.set(client.clone());
    Link {
        client,
        server,
        to_server,
        to_client,
    }
}
