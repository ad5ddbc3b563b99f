//! # Handler
//!
//! Async event handler through which the bridge notifies the host
//! shell.

use std::{fmt, future::Future, io, pin::Pin, sync::Arc};

use tracing::trace;

type HandlerFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

pub(crate) type EventHandler<E> = dyn Fn(E) -> HandlerFuture + Send + Sync;

/// Handler accepting every event without doing anything.
pub(crate) fn noop<E>() -> Arc<EventHandler<E>> {
    Arc::new(|_| Box::pin(async { Ok(()) }))
}

pub(crate) fn boxed<E, F>(handler: impl Fn(E) -> F + Send + Sync + 'static) -> Arc<EventHandler<E>>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(handler(event)))
}

/// Delivers the given event to the handler.
pub(crate) async fn fire<E: fmt::Debug>(handler: &EventHandler<E>, event: E) -> io::Result<()> {
    trace!(?event, "fire bridge event");
    handler(event).await
}
