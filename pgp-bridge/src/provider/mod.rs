//! # Provider
//!
//! Module dedicated to OpenPGP providers. A provider is an external,
//! independently-running process performing the actual cryptographic
//! operations. The bridge only reaches it through the three
//! capabilities of the [`Provider`] trait: bind, call and unbind.
//!
//! Two providers are shipped: [`MemoryProvider`], a scripted provider
//! living in memory, and [`TcpProvider`], which reaches a provider
//! daemon over TCP.

pub mod memory;
#[cfg(feature = "tcp")]
pub mod tcp;

use std::{io, sync::Arc};

use async_trait::async_trait;

#[doc(inline)]
pub use self::memory::MemoryProvider;
#[cfg(feature = "tcp")]
#[doc(inline)]
pub use self::tcp::TcpProvider;
use crate::{outcome::RawReply, request::ActionDescriptor};

/// Opaque reference to a bound provider.
///
/// Handles are issued by [`Provider::bind`] and shared by all calls
/// in flight. A handle becomes invalid as soon as the connection that
/// issued it is released.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProviderHandle {
    session: u64,
    service_id: String,
}

impl ProviderHandle {
    pub fn new(session: u64, service_id: impl ToString) -> Self {
        Self {
            session,
            service_id: service_id.to_string(),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

/// The provider trait.
///
/// Production and test providers implement this trait. Errors are
/// plain [`io::Error`]s: [`io::ErrorKind::InvalidData`] reports a
/// reply that does not follow the protocol, any other kind means the
/// channel to the provider is lost.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Binds the provider service matching the given identifier.
    async fn bind(&self, service_id: &str) -> io::Result<ProviderHandle>;

    /// Calls the provider.
    ///
    /// The input is the payload byte stream, fully consumed by the
    /// call.
    async fn call(
        &self,
        handle: &ProviderHandle,
        descriptor: &ActionDescriptor,
        input: Vec<u8>,
    ) -> io::Result<RawReply>;

    /// Releases the given binding.
    async fn unbind(&self, handle: &ProviderHandle) -> io::Result<()>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    async fn bind(&self, service_id: &str) -> io::Result<ProviderHandle> {
        (**self).bind(service_id).await
    }

    async fn call(
        &self,
        handle: &ProviderHandle,
        descriptor: &ActionDescriptor,
        input: Vec<u8>,
    ) -> io::Result<RawReply> {
        (**self).call(handle, descriptor, input).await
    }

    async fn unbind(&self, handle: &ProviderHandle) -> io::Result<()> {
        (**self).unbind(handle).await
    }
}
