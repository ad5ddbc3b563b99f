//! # Memory provider
//!
//! This module contains a provider living in memory. It replays a
//! script of replies and records every call it receives, which makes
//! it suitable for deterministic tests and demos.

use std::{
    collections::VecDeque,
    future, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{Provider, ProviderHandle};
use crate::{outcome::RawReply, request::ActionDescriptor};

/// A scripted provider behaviour, consumed by one call.
#[derive(Clone, Debug)]
pub enum Scripted {
    /// Answer with the given reply.
    Reply(RawReply),

    /// Never answer.
    Hang,

    /// Lose the channel in the middle of the call.
    Crash,
}

/// A call received by the [`MemoryProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedCall {
    pub handle: ProviderHandle,
    pub descriptor: ActionDescriptor,
    pub input: Vec<u8>,
}

/// The memory provider.
///
/// Each call consumes the next scripted behaviour. A call that finds
/// the script empty behaves like a crash.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<RecordedCall>>,
    refuse_binds: AtomicBool,
    sessions: AtomicU64,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, scripted: Scripted) {
        lock(&self.script).push_back(scripted);
    }

    pub fn push_reply(&self, reply: RawReply) {
        self.push(Scripted::Reply(reply));
    }

    pub fn with_reply(self, reply: RawReply) -> Self {
        self.push_reply(reply);
        self
    }

    pub fn with_hang(self) -> Self {
        self.push(Scripted::Hang);
        self
    }

    pub fn with_crash(self) -> Self {
        self.push(Scripted::Crash);
        self
    }

    pub fn set_refuse_binds(&self, refuse: bool) {
        self.refuse_binds.store(refuse, Ordering::SeqCst);
    }

    pub fn refusing_binds(self) -> Self {
        self.set_refuse_binds(true);
        self
    }

    /// Returns a copy of all the calls received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn bind(&self, service_id: &str) -> io::Result<ProviderHandle> {
        if self.refuse_binds.load(Ordering::SeqCst) {
            debug!(service = service_id, "memory provider refused bind");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("service {service_id} not available"),
            ));
        }

        self.binds.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderHandle::new(session, service_id))
    }

    async fn call(
        &self,
        handle: &ProviderHandle,
        descriptor: &ActionDescriptor,
        input: Vec<u8>,
    ) -> io::Result<RawReply> {
        trace!(session = handle.session(), input_len = input.len(), "memory provider call");

        lock(&self.calls).push(RecordedCall {
            handle: handle.clone(),
            descriptor: descriptor.clone(),
            input,
        });

        let scripted = lock(&self.script).pop_front().unwrap_or(Scripted::Crash);

        match scripted {
            Scripted::Reply(reply) => Ok(reply),
            Scripted::Hang => future::pending().await,
            Scripted::Crash => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory provider crashed",
            )),
        }
    }

    async fn unbind(&self, _handle: &ProviderHandle) -> io::Result<()> {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
