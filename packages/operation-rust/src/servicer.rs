//! Service-side customer code.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Subscription;
use futures_util::future::BoxFuture;

use crate::context::OperationContext;
use crate::emission::Operator;
use crate::ingestion::Inbound;

/// Everything a handler needs to serve one call.
#[derive(Debug)]
pub struct ServiceCall {
    pub group: String,
    pub method: String,
    pub context: OperationContext,
    pub inbound: Inbound,
    pub operator: Operator,
}

/// Serves inbound invocations.
///
/// `service` runs on the pool, one task per call. Returning `Err` or
/// panicking aborts the call as erroneous; cancellation and expiry cancel
/// the task.
#[async_trait]
pub trait Servicer: Send + Sync + 'static {
    /// How much of the invoker's stream this service wants delivered.
    fn subscription(&self, _group: &str, _method: &str) -> Subscription {
        Subscription::Full
    }

    /// Serves one call.
    ///
    /// # Errors
    ///
    /// Any error aborts the call with an erroneous outcome carrying the
    /// error's message.
    async fn service(&self, call: ServiceCall) -> anyhow::Result<()>;
}

/// [`Servicer`] built from an async closure.
pub struct ServiceFn<F> {
    handler: F,
}

/// Wraps `handler` as a [`Servicer`].
pub fn service_fn<F, Fut>(handler: F) -> Arc<dyn Servicer>
where
    F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ServiceFn { handler })
}

#[async_trait]
impl<F, Fut> Servicer for ServiceFn<F>
where
    F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn service(&self, call: ServiceCall) -> anyhow::Result<()> {
        (self.handler)(call).await
    }
}

/// Launches `servicer` for one call with an owned handle, so the handler
/// future does not borrow from the operation.
pub(crate) fn launch(
    servicer: Arc<dyn Servicer>,
) -> impl FnOnce(ServiceCall) -> BoxFuture<'static, anyhow::Result<()>> + Send {
    move |call: ServiceCall| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { servicer.service(call).await })
    }
}
