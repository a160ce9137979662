use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::connection::{Inbound, Outbound};
use crate::error::HandlerError;

/// A route handler.
///
/// The handler receives the device's stream handles and may read further frames
/// from the peer or write frames back before returning. The status frame is
/// written by the session after the handler returns, so handlers must not send one.
///
/// Implemented for any `Fn(Inbound, Outbound) -> impl Future<Output = Result<(), HandlerError>>`.
///
/// # Example
/// ```ignore
/// async fn echo(inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
///     let frame = inbound.read_frame().await?;
///     outbound.send(frame.payload).await?;
///     Ok(())
/// }
///
/// app.register_put("/echo", echo)?;
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call(&self, inbound: Inbound, outbound: Outbound) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Inbound, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, inbound: Inbound, outbound: Outbound) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(inbound, outbound))
    }
}

/// A registered (verb, path) binding. Immutable once created.
#[derive(Clone)]
pub struct Route {
    verb: String,
    path: String,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn new(verb: impl Into<String>, path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
            handler,
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("verb", &self.verb)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
