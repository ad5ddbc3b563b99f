//! # Error
//!
//! Module dedicated to bridge errors. It contains an [`Error`] enum
//! based on [`thiserror::Error`] and a type alias [`Result`].
//!
//! Every failure an operation can end with goes through this enum,
//! whether it is detected before reaching the provider, reported by
//! the provider itself or caused by the host shell.

use std::{io, num::ParseIntError};

use thiserror::Error;

use crate::correlator::RequestCode;

/// The global `Result` alias of the library.
pub type Result<T> = std::result::Result<T, Error>;

/// The global `Error` enum of the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot submit pgp operation: provider not connected")]
    NotConnectedError,
    #[error("cannot build pgp operation request: {0}")]
    InvalidRequestError(String),
    #[error("cannot complete pgp operation: provider died")]
    ProviderDiedError(#[source] io::Error),
    #[error("cannot complete pgp operation: provider disconnected")]
    DisconnectedError,
    #[error("cannot interpret pgp provider reply: {0}")]
    MalformedReplyError(String),
    #[error("cannot complete pgp operation: interaction cancelled by user")]
    UserCancelledError,
    #[error("cannot resume pgp operation: no pending interaction for request code {0}")]
    StaleInteractionError(RequestCode),
    #[error("pgp provider returned error {code}: {message}")]
    ProviderError { code: i32, message: String },
    #[error("cannot complete pgp operation: operation cancelled")]
    CancelledError,

    #[error("cannot bind pgp provider {1}")]
    BindProviderError(#[source] io::Error, String),
    #[error("cannot unbind pgp provider {1}")]
    UnbindProviderError(#[source] io::Error, String),
    #[error("cannot launch interaction for request code {1}")]
    LaunchInteractionError(#[source] io::Error, RequestCode),
    #[error("cannot find async runtime to spawn pgp operations")]
    GetRuntimeError(#[source] tokio::runtime::TryCurrentError),
    #[error("cannot parse pgp key id {1}")]
    ParseKeyIdError(#[source] ParseIntError, String),
}

impl Error {
    /// Maps an I/O error raised by a provider call to the matching
    /// operation failure.
    ///
    /// Invalid data means the provider answered something that does
    /// not follow the protocol, any other I/O error means the channel
    /// to the provider is gone.
    pub fn from_provider_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::InvalidData {
            Self::MalformedReplyError(err.to_string())
        } else {
            Self::ProviderDiedError(err)
        }
    }

    /// Returns `true` if the failure was decided by the user or the
    /// caller rather than by the provider.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelledError | Self::CancelledError)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::Error;

    #[test]
    fn provider_io_errors() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "bad json");
        assert!(matches!(
            Error::from_provider_io(err),
            Error::MalformedReplyError(msg) if msg == "bad json"
        ));

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            Error::from_provider_io(err),
            Error::ProviderDiedError(err) if err.kind() == io::ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn provider_error_message() {
        let err = Error::ProviderError {
            code: 13,
            message: "no public key".into(),
        };
        assert_eq!(
            err.to_string(),
            "pgp provider returned error 13: no public key"
        );
        assert!(!err.is_cancellation());
        assert!(Error::UserCancelledError.is_cancellation());
    }
}
