//! # Correlator
//!
//! Module dedicated to user interactions. When a provider needs the
//! user, the operation is suspended in the [`InteractionCorrelator`]
//! under a fresh [`RequestCode`]. The host later reports the modal
//! result under the same code, which resumes the operation.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{outcome::ContinuationToken, request::OperationRequest, Error, Result};

/// Integer tag correlating a user interaction with its completion
/// report.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct RequestCode(u32);

impl RequestCode {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for RequestCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the user closed the interaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum ModalStatus {
    Ok,
    Cancelled,
}

/// The completion report of a user interaction, as delivered by the
/// host shell.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct ModalResult {
    pub request_code: RequestCode,
    pub status: ModalStatus,
    #[cfg_attr(
        feature = "derive",
        serde(default, with = "crate::encoding::option_bytes")
    )]
    pub data: Option<Vec<u8>>,
}

impl ModalResult {
    pub fn ok(request_code: RequestCode) -> Self {
        Self {
            request_code,
            status: ModalStatus::Ok,
            data: None,
        }
    }

    pub fn cancelled(request_code: RequestCode) -> Self {
        Self {
            request_code,
            status: ModalStatus::Cancelled,
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// What a suspended operation receives when its interaction ends.
#[derive(Debug)]
pub enum Resumption {
    /// The user completed the step: the same request must be
    /// re-issued along with the continuation token.
    Retry {
        request: OperationRequest,
        continuation: ContinuationToken,
        data: Option<Vec<u8>>,
    },

    /// The user dismissed the step.
    Cancelled,
}

/// An operation suspended on a user interaction.
#[derive(Debug)]
pub struct PendingInteraction {
    pub request_code: RequestCode,
    pub continuation: ContinuationToken,
    pub request: OperationRequest,
    resume: oneshot::Sender<Resumption>,
}

/// The interaction correlator.
///
/// Request codes are unique among pending interactions, and each
/// pending interaction is resumed at most once. The table is only
/// locked for map accesses, never while resuming an operation.
#[derive(Debug)]
pub struct InteractionCorrelator {
    next_code: AtomicU32,
    pending: Mutex<HashMap<RequestCode, PendingInteraction>>,
}

impl Default for InteractionCorrelator {
    fn default() -> Self {
        Self {
            next_code: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl InteractionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestCode, PendingInteraction>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspends an operation.
    ///
    /// Returns the request code allocated for the interaction and the
    /// receiver the operation waits on until it is resumed.
    pub fn suspend(
        &self,
        continuation: ContinuationToken,
        request: OperationRequest,
    ) -> (RequestCode, oneshot::Receiver<Resumption>) {
        let (resume, rx) = oneshot::channel();
        let mut pending = self.lock();

        let request_code = loop {
            let code = RequestCode(self.next_code.fetch_add(1, Ordering::Relaxed));
            // 0 is never handed out, and wrapped codes skip live ones
            if code.0 != 0 && !pending.contains_key(&code) {
                break code;
            }
        };

        trace!(%request_code, action = %request.action(), "suspend operation");

        pending.insert(
            request_code,
            PendingInteraction {
                request_code,
                continuation,
                request,
                resume,
            },
        );

        (request_code, rx)
    }

    /// Resumes the operation suspended under the modal result request
    /// code.
    ///
    /// Fails with a stale interaction error if no operation waits on
    /// that code, either because it never existed or because it was
    /// already resumed or cancelled.
    pub fn resume(&self, result: ModalResult) -> Result<()> {
        let code = result.request_code;

        let Some(interaction) = self.lock().remove(&code) else {
            warn!(request_code = %code, "modal result without pending interaction");
            return Err(Error::StaleInteractionError(code));
        };

        let resumption = match result.status {
            ModalStatus::Ok => Resumption::Retry {
                request: interaction.request,
                continuation: interaction.continuation,
                data: result.data,
            },
            ModalStatus::Cancelled => Resumption::Cancelled,
        };

        debug!(request_code = %code, status = ?result.status, "resume operation");

        interaction
            .resume
            .send(resumption)
            .map_err(|_| Error::StaleInteractionError(code))
    }

    /// Removes the given pending interaction without resuming it.
    pub fn cancel(&self, code: RequestCode) -> Option<PendingInteraction> {
        let interaction = self.lock().remove(&code);
        if interaction.is_some() {
            debug!(request_code = %code, "cancel pending interaction");
        }
        interaction
    }

    /// Removes all pending interactions without resuming them.
    ///
    /// Operations waiting on them observe a dropped resumption
    /// channel. Returns the codes that were pending.
    pub fn abort_all(&self) -> Vec<RequestCode> {
        let mut codes: Vec<_> = self.lock().drain().map(|(code, _)| code).collect();
        codes.sort();
        if !codes.is_empty() {
            debug!(count = codes.len(), "abort pending interactions");
        }
        codes
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_pending(&self, code: RequestCode) -> bool {
        self.lock().contains_key(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Action;

    fn request() -> OperationRequest {
        OperationRequest::builder(Action::Encrypt)
            .with_recipient("alice@example.com")
            .with_payload("hello")
            .build()
            .unwrap()
    }

    fn token(bytes: &[u8]) -> ContinuationToken {
        ContinuationToken::from(bytes)
    }

    #[tokio::test]
    async fn suspend_then_resume() {
        let correlator = InteractionCorrelator::new();

        let (code, rx) = correlator.suspend(token(b"t1"), request());
        assert_eq!(code, RequestCode::from(1));
        assert!(correlator.is_pending(code));

        correlator
            .resume(ModalResult::ok(code).with_data("passphrase ok"))
            .unwrap();
        assert!(correlator.is_empty());

        match rx.await.unwrap() {
            Resumption::Retry {
                request,
                continuation,
                data,
            } => {
                assert_eq!(request.payload(), b"hello");
                assert_eq!(continuation, token(b"t1"));
                assert_eq!(data.as_deref(), Some(&b"passphrase ok"[..]));
            }
            res => panic!("unexpected resumption: {res:?}"),
        }

        // a second report for the same code is stale
        assert!(matches!(
            correlator.resume(ModalResult::ok(code)),
            Err(Error::StaleInteractionError(code)) if code.get() == 1
        ));
    }

    #[tokio::test]
    async fn resume_cancelled() {
        let correlator = InteractionCorrelator::new();
        let (code, rx) = correlator.suspend(token(b"t1"), request());

        correlator.resume(ModalResult::cancelled(code)).unwrap();
        assert!(matches!(rx.await.unwrap(), Resumption::Cancelled));
    }

    #[test]
    fn unique_codes() {
        let correlator = InteractionCorrelator::new();

        let (c1, _rx1) = correlator.suspend(token(b"a"), request());
        let (c2, _rx2) = correlator.suspend(token(b"b"), request());
        let (c3, _rx3) = correlator.suspend(token(b"c"), request());

        assert_eq!([c1.get(), c2.get(), c3.get()], [1, 2, 3]);
        assert_eq!(correlator.len(), 3);
    }

    #[test]
    fn wrapped_codes_skip_zero_and_live_ones() {
        let correlator = InteractionCorrelator::new();
        let (live, _rx) = correlator.suspend(token(b"a"), request());
        assert_eq!(live.get(), 1);

        correlator.next_code.store(u32::MAX, Ordering::Relaxed);

        let (code, _rx) = correlator.suspend(token(b"b"), request());
        assert_eq!(code.get(), u32::MAX);

        let (code, _rx) = correlator.suspend(token(b"c"), request());
        assert_eq!(code.get(), 2);
    }

    #[test]
    fn cancel_and_abort() {
        let correlator = InteractionCorrelator::new();

        let (c1, mut rx1) = correlator.suspend(token(b"a"), request());
        let (c2, mut rx2) = correlator.suspend(token(b"b"), request());

        let cancelled = correlator.cancel(c1).unwrap();
        assert_eq!(cancelled.continuation, token(b"a"));
        assert!(correlator.cancel(c1).is_none());
        assert!(rx1.try_recv().is_err());
        assert!(matches!(
            correlator.resume(ModalResult::ok(c1)),
            Err(Error::StaleInteractionError(_))
        ));

        assert_eq!(correlator.abort_all(), vec![c2]);
        assert!(correlator.is_empty());
        assert!(matches!(
            rx2.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn resume_dropped_operation() {
        let correlator = InteractionCorrelator::new();
        let (code, rx) = correlator.suspend(token(b"a"), request());
        drop(rx);

        assert!(matches!(
            correlator.resume(ModalResult::ok(code)),
            Err(Error::StaleInteractionError(_))
        ));
        assert!(correlator.is_empty());
    }
}
