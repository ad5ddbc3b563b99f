//! # Dispatcher
//!
//! Module dedicated to asynchronous provider calls. The
//! [`Dispatcher`] runs every call on a background task, bounded by a
//! worker pool, and hands a [`Dispatch`] back to the caller. The
//! dispatch resolves to exactly one [`CallOutcome`].

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    runtime::Handle,
    sync::{oneshot, watch, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{
    connection::ConnectionState,
    outcome::{interpret, CallOutcome},
    provider::{Provider, ProviderHandle},
    request::ActionDescriptor,
    Error,
};

/// The default number of provider calls running in parallel.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// The asynchronous call dispatcher.
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    runtime: Handle,
    workers: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn Provider>, runtime: Handle, pool_size: usize) -> Self {
        Self {
            provider,
            runtime,
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Dispatches a call to the provider.
    ///
    /// Never blocks: the call runs on a background task as soon as a
    /// worker is available. The given state receiver is watched
    /// during the call, which fails with a disconnected error when
    /// the handle is released before the provider answers.
    pub fn dispatch(
        &self,
        handle: ProviderHandle,
        descriptor: ActionDescriptor,
        input: Vec<u8>,
        mut state: watch::Receiver<ConnectionState>,
    ) -> Dispatch {
        let (tx, rx) = oneshot::channel();
        let provider = self.provider.clone();
        let workers = self.workers.clone();

        trace!(action = %descriptor.action, input_len = input.len(), "dispatching provider call");

        let task = self.runtime.spawn(async move {
            let outcome = tokio::select! {
                outcome = call(provider, workers, &handle, &descriptor, input) => outcome,
                _ = released(&mut state, &handle) => {
                    debug!(session = handle.session(), "provider released during call");
                    CallOutcome::Failure(Error::DisconnectedError)
                }
            };

            if tx.send(outcome).is_err() {
                debug!("provider call outcome discarded: dispatch dropped");
            }
        });

        Dispatch { rx, task }
    }
}

async fn call(
    provider: Arc<dyn Provider>,
    workers: Arc<Semaphore>,
    handle: &ProviderHandle,
    descriptor: &ActionDescriptor,
    input: Vec<u8>,
) -> CallOutcome {
    let _worker = match workers.acquire_owned().await {
        Ok(worker) => worker,
        Err(err) => {
            let err = io::Error::new(io::ErrorKind::Other, err);
            return CallOutcome::Failure(Error::ProviderDiedError(err));
        }
    };

    match provider.call(handle, descriptor, input).await {
        Ok(reply) => interpret(reply),
        Err(err) => CallOutcome::Failure(Error::from_provider_io(err)),
    }
}

/// Resolves once the connection no longer holds the given handle.
async fn released(state: &mut watch::Receiver<ConnectionState>, handle: &ProviderHandle) {
    loop {
        let bound = state.borrow_and_update().is_bound_to(handle);
        if !bound {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// A provider call in flight.
///
/// Resolves to the [`CallOutcome`] of the call. If the background
/// task ends without producing an outcome (panicking provider,
/// runtime shutting down), the dispatch still resolves, to a
/// provider died error.
#[derive(Debug)]
pub struct Dispatch {
    rx: oneshot::Receiver<CallOutcome>,
    task: JoinHandle<()>,
}

impl Dispatch {
    /// Attempts to abort the call.
    ///
    /// If the call already produced its outcome, the outcome is
    /// discarded.
    pub fn abort(self) {
        self.task.abort();
    }
}

impl Future for Dispatch {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => {
                let err = io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "provider call ended without outcome",
                );
                Poll::Ready(CallOutcome::Failure(Error::ProviderDiedError(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use async_trait::async_trait;
    use tokio::runtime::Handle;

    use super::*;
    use crate::{
        connection::ProviderConnection,
        outcome::RawReply,
        provider::MemoryProvider,
        request::{Action, OperationRequest},
    };

    fn descriptor() -> ActionDescriptor {
        OperationRequest::builder(Action::Encrypt)
            .with_recipient("alice@example.com")
            .build()
            .unwrap()
            .descriptor(None, None)
    }

    #[tokio::test]
    async fn dispatch_success() {
        let provider = Arc::new(MemoryProvider::new().with_reply(RawReply::success("out")));
        let conn = ProviderConnection::new(provider.clone(), "com.example.pgp", Handle::current());
        conn.connect().await.unwrap();

        let dispatcher = Dispatcher::new(provider.clone(), Handle::current(), 2);
        let dispatch = dispatcher.dispatch(
            conn.handle().unwrap(),
            descriptor(),
            b"in".to_vec(),
            conn.subscribe(),
        );

        match dispatch.await {
            CallOutcome::Success { output } => assert_eq!(output, b"out"),
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }

        assert_eq!(provider.calls()[0].input, b"in");
    }

    #[tokio::test]
    async fn dispatch_crash() {
        let provider = Arc::new(MemoryProvider::new().with_crash());
        let conn = ProviderConnection::new(provider.clone(), "com.example.pgp", Handle::current());
        conn.connect().await.unwrap();

        let dispatcher = Dispatcher::new(provider, Handle::current(), 2);
        let outcome = dispatcher
            .dispatch(conn.handle().unwrap(), descriptor(), Vec::new(), conn.subscribe())
            .await;

        assert!(matches!(
            outcome,
            CallOutcome::Failure(Error::ProviderDiedError(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_released_mid_call() {
        let provider = Arc::new(MemoryProvider::new().with_hang());
        let conn = ProviderConnection::new(provider.clone(), "com.example.pgp", Handle::current());
        conn.connect().await.unwrap();

        let dispatcher = Dispatcher::new(provider, Handle::current(), 2);
        let dispatch =
            dispatcher.dispatch(conn.handle().unwrap(), descriptor(), Vec::new(), conn.subscribe());

        conn.disconnect().await.unwrap();

        assert!(matches!(
            dispatch.await,
            CallOutcome::Failure(Error::DisconnectedError)
        ));
    }

    struct PanickingProvider;

    #[async_trait]
    impl Provider for PanickingProvider {
        async fn bind(&self, service_id: &str) -> io::Result<ProviderHandle> {
            Ok(ProviderHandle::new(1, service_id))
        }

        async fn call(
            &self,
            _handle: &ProviderHandle,
            _descriptor: &ActionDescriptor,
            _input: Vec<u8>,
        ) -> io::Result<RawReply> {
            panic!("provider exploded")
        }

        async fn unbind(&self, _handle: &ProviderHandle) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_panic() {
        let provider: Arc<dyn Provider> = Arc::new(PanickingProvider);
        let conn = ProviderConnection::new(provider.clone(), "com.example.pgp", Handle::current());
        conn.connect().await.unwrap();

        let dispatcher = Dispatcher::new(provider, Handle::current(), 1);
        let outcome = dispatcher
            .dispatch(conn.handle().unwrap(), descriptor(), Vec::new(), conn.subscribe())
            .await;

        assert!(matches!(
            outcome,
            CallOutcome::Failure(Error::ProviderDiedError(_))
        ));
    }
}
