//! # Bridge
//!
//! Module dedicated to the bridge itself. The [`PgpBridge`] ties the
//! provider connection, the call dispatcher and the interaction
//! correlator together, so that callers only see a single-shot
//! contract: submit a request, eventually get the output bytes or
//! the reason of the failure.
//!
//! ```no_run
//! use pgp_bridge::{
//!     config::KeyConfiguration, provider::MemoryProvider, Action, BridgeEvent, PgpBridge,
//! };
//!
//! # async fn run() -> pgp_bridge::Result<()> {
//! let config = KeyConfiguration::new("com.example.pgp", "alice");
//! let bridge = PgpBridge::builder(MemoryProvider::new(), config)
//!     .with_handler(|event| async move {
//!         if let BridgeEvent::LaunchInteraction { request_code, .. } = event {
//!             println!("present interaction {request_code}");
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//! bridge.connect().await?;
//!
//! let request = bridge
//!     .request(Action::Encrypt)
//!     .with_recipient("bob@example.com")
//!     .with_payload("hello")
//!     .build()?;
//!
//! let armored = bridge.submit(request).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use tokio::{
    runtime::Handle,
    sync::{oneshot, watch, Notify},
};
use tracing::{debug, info, warn};

use crate::{
    config::KeyConfiguration,
    connection::ProviderConnection,
    correlator::{InteractionCorrelator, ModalResult, RequestCode, Resumption},
    dispatcher::{Dispatcher, DEFAULT_POOL_SIZE},
    handler::{self, EventHandler},
    outcome::{CallOutcome, ContinuationToken, InteractionHandle},
    provider::{Provider, ProviderHandle},
    request::{Action, OperationRequest, OperationRequestBuilder},
    Error, Result,
};

/// The events the bridge sends to the host shell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BridgeEvent {
    /// The provider with the given service id is bound.
    Connected(String),

    /// The provider with the given service id is released.
    Disconnected(String),

    /// The host must present the given interaction, then report its
    /// result with [`PgpBridge::on_modal_result`] under the same
    /// request code.
    LaunchInteraction {
        request_code: RequestCode,
        interaction: InteractionHandle,
    },

    /// The operation suspended under the given code is retried.
    InteractionResumed(RequestCode),

    /// The operation suspended under the given code will not resume.
    InteractionCancelled(RequestCode),
}

/// The state of a submitted operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OperationState {
    #[default]
    Idle,

    /// A provider call is in flight.
    AwaitingCall,

    /// The operation waits for the host to report the modal result of
    /// the interaction with the given code.
    AwaitingInteraction(RequestCode),

    Completed,
}

/// Cancellation request shared by an [`Operation`] and its driver.
#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn requested(&self) {
        self.notify.notified().await
    }
}

struct Inner {
    config: KeyConfiguration,
    connection: ProviderConnection,
    dispatcher: Dispatcher,
    correlator: Arc<InteractionCorrelator>,
    handler: Arc<EventHandler<BridgeEvent>>,
    runtime: Handle,
}

impl Inner {
    async fn fire_event(&self, event: BridgeEvent) {
        if let Err(err) = handler::fire(&*self.handler, event.clone()).await {
            warn!("cannot fire event {event:?}, skipping it");
            debug!("{err}");
        }
    }

    async fn complete(
        self: Arc<Self>,
        handle: ProviderHandle,
        request: OperationRequest,
        state: watch::Sender<OperationState>,
        cancel: Arc<CancelSignal>,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    ) {
        let action = request.action();
        let res = self.run(handle, request, &state, &cancel).await;

        match &res {
            Ok(output) => info!(%action, output_len = output.len(), "pgp operation succeeded"),
            Err(err) => info!(%action, "pgp operation failed: {err}"),
        }

        state.send_replace(OperationState::Completed);

        if tx.send(res).is_err() {
            debug!(%action, "pgp operation outcome discarded: operation dropped");
        }
    }

    async fn run(
        &self,
        handle: ProviderHandle,
        mut request: OperationRequest,
        state: &watch::Sender<OperationState>,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>> {
        let mut continuation: Option<ContinuationToken> = None;
        let mut data: Option<Vec<u8>> = None;

        loop {
            state.send_replace(OperationState::AwaitingCall);

            let descriptor = request.descriptor(continuation.take(), data.take());
            let input = request.payload().to_vec();
            let mut dispatch =
                self.dispatcher
                    .dispatch(handle.clone(), descriptor, input, self.connection.subscribe());

            let outcome = tokio::select! {
                biased;
                _ = cancel.requested() => {
                    debug!("operation cancelled while awaiting provider call");
                    dispatch.abort();
                    return Err(Error::CancelledError);
                }
                outcome = &mut dispatch => outcome,
            };

            let (token, interaction) = match outcome {
                CallOutcome::Success { output } => return Ok(output),
                CallOutcome::Failure(err) => return Err(err),
                CallOutcome::InteractionRequired {
                    continuation,
                    interaction,
                } => (continuation, interaction),
            };

            let (code, resumption) = self.correlator.suspend(token, request);
            state.send_replace(OperationState::AwaitingInteraction(code));

            // a disconnection may have aborted pending interactions
            // between the reply and the suspension
            if !self.connection.state().is_bound_to(&handle) {
                self.correlator.cancel(code);
                return Err(Error::DisconnectedError);
            }

            // a cancellation requested before the state switch could
            // not remove the pending interaction by itself
            if cancel.is_requested() {
                debug!(request_code = %code, "operation cancelled before interaction launch");
                self.correlator.cancel(code);
                return Err(Error::CancelledError);
            }

            let event = BridgeEvent::LaunchInteraction {
                request_code: code,
                interaction,
            };

            if let Err(err) = handler::fire(&*self.handler, event).await {
                self.correlator.cancel(code);
                return Err(Error::LaunchInteractionError(err, code));
            }

            // the cancel branch goes first: a cancelled operation
            // never resumes, even if its modal result already arrived
            let resumption = tokio::select! {
                biased;
                _ = cancel.requested() => {
                    debug!(request_code = %code, "operation cancelled while awaiting interaction");
                    self.correlator.cancel(code);
                    self.fire_event(BridgeEvent::InteractionCancelled(code)).await;
                    return Err(Error::CancelledError);
                }
                resumption = resumption => resumption,
            };

            match resumption {
                Ok(Resumption::Retry {
                    request: retry,
                    continuation: token,
                    data: result,
                }) => {
                    self.fire_event(BridgeEvent::InteractionResumed(code)).await;

                    if !self.connection.state().is_bound_to(&handle) {
                        return Err(Error::DisconnectedError);
                    }

                    request = retry;
                    continuation = Some(token);
                    data = result;
                }
                Ok(Resumption::Cancelled) => {
                    self.fire_event(BridgeEvent::InteractionCancelled(code)).await;
                    return Err(Error::UserCancelledError);
                }
                Err(_) => {
                    debug!(request_code = %code, "pending interaction aborted");
                    return Err(Error::DisconnectedError);
                }
            }
        }
    }
}

/// The PGP operation bridge.
///
/// Cheap to clone: clones share the same connection, dispatcher and
/// correlator.
#[derive(Clone)]
pub struct PgpBridge {
    inner: Arc<Inner>,
}

impl PgpBridge {
    pub fn builder(provider: impl Provider + 'static, config: KeyConfiguration) -> BridgeBuilder {
        BridgeBuilder::new(provider, config)
    }

    pub fn config(&self) -> &KeyConfiguration {
        &self.inner.config
    }

    pub fn is_ready(&self) -> bool {
        self.inner.connection.is_ready()
    }

    /// Binds the provider matching the configured provider id.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await?;
        let service_id = self.inner.connection.service_id().to_owned();
        self.inner.fire_event(BridgeEvent::Connected(service_id)).await;
        Ok(())
    }

    /// Releases the provider.
    ///
    /// Calls in flight and operations waiting for an interaction all
    /// complete with a disconnected error. Modal results reported
    /// afterwards are stale.
    pub async fn disconnect(&self) -> Result<()> {
        let res = self.inner.connection.disconnect().await;

        for code in self.inner.correlator.abort_all() {
            self.inner
                .fire_event(BridgeEvent::InteractionCancelled(code))
                .await;
        }

        let service_id = self.inner.connection.service_id().to_owned();
        self.inner
            .fire_event(BridgeEvent::Disconnected(service_id))
            .await;

        res
    }

    /// Starts a request builder for the given action, with the key
    /// configuration already applied.
    pub fn request(&self, action: Action) -> OperationRequestBuilder {
        OperationRequest::builder(action).with_key_config(&self.inner.config)
    }

    /// Submits an operation request.
    ///
    /// Never blocks, and can be called from any thread. The returned
    /// [`Operation`] resolves exactly once. When the provider is not
    /// connected, it resolves right away to a not connected error
    /// without reaching the provider.
    pub fn submit(&self, request: OperationRequest) -> Operation {
        let (tx, rx) = oneshot::channel();
        let (state, state_rx) = watch::channel(OperationState::Idle);
        let cancel = Arc::new(CancelSignal::default());

        match self.inner.connection.handle() {
            Err(err) => {
                debug!(action = %request.action(), "cannot submit pgp operation: {err}");
                state.send_replace(OperationState::Completed);
                let _ = tx.send(Err(err));
            }
            Ok(handle) => {
                info!(action = %request.action(), session = handle.session(), "submit pgp operation");
                state.send_replace(OperationState::AwaitingCall);
                let inner = self.inner.clone();
                let op = inner.clone().complete(handle, request, state, cancel.clone(), tx);
                inner.runtime.spawn(op);
            }
        }

        Operation {
            rx,
            state: state_rx,
            cancel,
            correlator: self.inner.correlator.clone(),
        }
    }

    /// Reports the result of a user interaction.
    ///
    /// Resumes the operation suspended under the result request code.
    /// Fails with a stale interaction error when no operation waits
    /// on that code. Never blocks.
    pub fn on_modal_result(&self, result: ModalResult) -> Result<()> {
        self.inner.correlator.resume(result)
    }

    /// Returns the number of operations waiting for an interaction.
    pub fn pending_interactions(&self) -> usize {
        self.inner.correlator.len()
    }
}

/// The bridge builder.
pub struct BridgeBuilder {
    provider: Arc<dyn Provider>,
    config: KeyConfiguration,
    pool_size: usize,
    runtime: Option<Handle>,
    handler: Arc<EventHandler<BridgeEvent>>,
}

impl BridgeBuilder {
    pub fn new(provider: impl Provider + 'static, config: KeyConfiguration) -> Self {
        Self {
            provider: Arc::new(provider),
            config,
            pool_size: DEFAULT_POOL_SIZE,
            runtime: None,
            handler: handler::noop(),
        }
    }

    /// Sets the maximum number of provider calls running in parallel.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the runtime the operations run on.
    ///
    /// Defaults to the runtime the bridge is built from.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_handler<F>(
        mut self,
        handler: impl Fn(BridgeEvent) -> F + Send + Sync + 'static,
    ) -> Self
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        self.handler = handler::boxed(handler);
        self
    }

    pub fn build(self) -> Result<PgpBridge> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(Error::GetRuntimeError)?,
        };

        let connection = ProviderConnection::new(
            self.provider.clone(),
            self.config.provider_id(),
            runtime.clone(),
        );
        let dispatcher = Dispatcher::new(self.provider, runtime.clone(), self.pool_size);

        let inner = Inner {
            config: self.config,
            connection,
            dispatcher,
            correlator: Arc::new(InteractionCorrelator::new()),
            handler: self.handler,
            runtime,
        };

        Ok(PgpBridge {
            inner: Arc::new(inner),
        })
    }
}

/// A submitted operation.
///
/// Resolves to the output bytes of the operation, whatever the number
/// of interaction rounds it went through. Dropping an operation does
/// not cancel it: use [`Operation::cancel`] for that.
#[derive(Debug)]
pub struct Operation {
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    state: watch::Receiver<OperationState>,
    cancel: Arc<CancelSignal>,
    correlator: Arc<InteractionCorrelator>,
}

impl Operation {
    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Requests the cancellation of the operation.
    ///
    /// A provider call in flight is aborted. A pending interaction is
    /// removed right away, so that a modal result reported after this
    /// call is stale. The operation then resolves to a cancelled
    /// error. Has no effect on a completed operation.
    pub fn cancel(&self) {
        // request before removing the entry: the driver must see the
        // cancellation before the dropped resumption channel
        self.cancel.request();

        if let OperationState::AwaitingInteraction(code) = *self.state.borrow() {
            self.correlator.cancel(code);
        }
    }
}

impl Future for Operation {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => {
                let err = io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pgp operation ended without outcome",
                );
                Poll::Ready(Err(Error::ProviderDiedError(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
