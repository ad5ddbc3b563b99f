//! # Connection
//!
//! Module dedicated to the provider connection. The
//! [`ProviderConnection`] owns the single binding to the provider and
//! publishes its [`ConnectionState`], so that calls in flight notice
//! when the binding goes away.

use std::{io, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::{watch, Mutex},
};
use tracing::{debug, info};

use crate::{
    provider::{Provider, ProviderHandle},
    Error, Result,
};

/// The connection state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// No binding.
    #[default]
    Disconnected,

    /// A bind is in progress.
    Connecting,

    /// The provider acknowledged the bind.
    Ready(ProviderHandle),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Returns `true` if the state still holds the given handle.
    pub fn is_bound_to(&self, handle: &ProviderHandle) -> bool {
        matches!(self, Self::Ready(h) if h == handle)
    }
}

/// The provider connection.
///
/// Readiness can be checked at any time without blocking, even while
/// a bind or an unbind is in progress. Binds and unbinds are
/// serialized: they never overlap. Binds run on the given runtime.
pub struct ProviderConnection {
    provider: Arc<dyn Provider>,
    service_id: String,
    runtime: Handle,
    lifecycle: Arc<Mutex<()>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ProviderConnection {
    pub fn new(provider: Arc<dyn Provider>, service_id: impl ToString, runtime: Handle) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            provider,
            service_id: service_id.to_string(),
            runtime,
            lifecycle: Arc::new(Mutex::new(())),
            state: Arc::new(state),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Returns the current handle, failing fast when the provider is
    /// not connected.
    pub fn handle(&self) -> Result<ProviderHandle> {
        match &*self.state.borrow() {
            ConnectionState::Ready(handle) => Ok(handle.clone()),
            _ => Err(Error::NotConnectedError),
        }
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Binds the provider.
    ///
    /// The connection becomes ready only once the provider
    /// acknowledged the bind. Connecting an already ready connection
    /// does nothing.
    ///
    /// Dropping the returned future does not abort the bind: a binding
    /// granted afterwards still makes the connection ready, so that
    /// [`Self::disconnect`] can release it.
    pub async fn connect(&self) -> Result<()> {
        let lifecycle = self.lifecycle.clone().lock_owned().await;

        if self.is_ready() {
            debug!(service = self.service_id, "provider already connected");
            return Ok(());
        }

        info!(service = self.service_id, "bind pgp provider");
        self.state.send_replace(ConnectionState::Connecting);

        let provider = self.provider.clone();
        let service_id = self.service_id.clone();
        let state = self.state.clone();

        let bind = self.runtime.spawn(async move {
            // released once the state is final
            let _lifecycle = lifecycle;

            match provider.bind(&service_id).await {
                Ok(handle) => {
                    debug!(session = handle.session(), "pgp provider bound");
                    state.send_replace(ConnectionState::Ready(handle));
                    Ok(())
                }
                Err(err) => {
                    state.send_replace(ConnectionState::Disconnected);
                    Err(Error::BindProviderError(err, service_id))
                }
            }
        });

        match bind.await {
            Ok(res) => res,
            Err(err) => {
                self.state.send_replace(ConnectionState::Disconnected);
                let err = io::Error::new(io::ErrorKind::Other, err);
                Err(Error::BindProviderError(err, self.service_id.clone()))
            }
        }
    }

    /// Releases the binding.
    ///
    /// The state switches to disconnected before the provider is
    /// unbound, so that calls in flight fail instead of waiting for a
    /// reply that will never come.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let prev = self.state.send_replace(ConnectionState::Disconnected);

        match prev {
            ConnectionState::Ready(handle) => {
                info!(session = handle.session(), "unbind pgp provider");
                self.provider
                    .unbind(&handle)
                    .await
                    .map_err(|err| Error::UnbindProviderError(err, self.service_id.clone()))
            }
            _ => {
                debug!(service = self.service_id, "provider already disconnected");
                Ok(())
            }
        }
    }
}
