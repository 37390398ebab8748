//! Loopback demo: two ends joined in-process, an echo servicer, and a batch
//! of calls whose outcomes are tallied at the end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use courier_core::{Ticket, Value};
use courier_operation::{
    service_fn, End, InvocationRequest, OperationConfig, ServiceCall, TokioPool,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loopback", about = "Run echo calls over an in-process link")]
struct Args {
    /// Number of calls to run.
    #[arg(long, env = "LOOPBACK_CALLS", default_value_t = 32)]
    calls: usize,

    /// Values streamed per call.
    #[arg(long, env = "LOOPBACK_VALUES", default_value_t = 8)]
    values: i64,

    /// Per-call timeout in milliseconds.
    #[arg(long, env = "LOOPBACK_TIMEOUT_MS", default_value_t = 2_000)]
    timeout_ms: u64,

    /// Flow-control window advertised by both ends.
    #[arg(long, env = "LOOPBACK_WINDOW", default_value_t = 4)]
    window: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = OperationConfig {
        ingestion_window: args.window,
        ..OperationConfig::default()
    };
    let (client, server) = connect(&config);
    info!(calls = args.calls, values = args.values, "starting loopback run");

    let mut calls = Vec::with_capacity(args.calls);
    for _ in 0..args.calls {
        let client = client.clone();
        let values = args.values;
        let timeout = Duration::from_millis(args.timeout_ms);
        calls.push(tokio::spawn(async move { run_call(&client, values, timeout).await }));
    }
    for call in calls {
        if let Err(err) = call.await? {
            warn!(error = %err, "call failed");
        }
    }

    let drained = server.stop(Duration::from_secs(1)).await;
    info!(
        drained,
        client = ?client.operation_stats(),
        server = ?server.operation_stats(),
        "loopback run finished"
    );
    Ok(())
}

/// Joins two ends with unbounded channels; the server end echoes.
fn connect(config: &OperationConfig) -> (End, End) {
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Ticket>();
    let (server_tx, server_rx) = mpsc::unbounded_channel::<Ticket>();
    let echo = service_fn(|mut call: ServiceCall| async move {
        while let Some(value) = call.inbound.next().await? {
            call.operator.consume(value).await?;
        }
        call.operator.terminate()?;
        anyhow::Ok(())
    });
    let client = End::new(
        config.clone(),
        Arc::new(client_tx),
        Arc::new(TokioPool::current()),
        None,
    );
    let server = End::new(
        config.clone(),
        Arc::new(server_tx),
        Arc::new(TokioPool::current()),
        Some(echo),
    );
    forward(client_rx, server.clone());
    forward(server_rx, client.clone());
    (client, server)
}

fn forward(mut rx: mpsc::UnboundedReceiver<Ticket>, to: End) {
    tokio::spawn(async move {
        while let Some(ticket) = rx.recv().await {
            to.receive_ticket(ticket);
        }
    });
}

async fn run_call(client: &End, values: i64, timeout: Duration) -> Result<()> {
    let request = InvocationRequest {
        timeout: Some(timeout),
        ..InvocationRequest::new("echo", "Stream")
    };
    let mut invocation = client.operate(request)?;
    for i in 0..values {
        invocation.operator.consume(Value::Int(i)).await?;
    }
    invocation.operator.terminate()?;

    let mut echoed = 0;
    while invocation.inbound.next().await?.is_some() {
        echoed += 1;
    }
    let outcome = invocation.context.outcome().await;
    info!(
        operation_id = %invocation.operation.id(),
        echoed,
        outcome = %outcome,
        "call finished"
    );
    Ok(())
}
