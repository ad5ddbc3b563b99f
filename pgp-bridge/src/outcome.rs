//! # Outcome
//!
//! Module dedicated to provider replies. A provider answers every
//! call with a [`RawReply`], which is then classified into a
//! [`CallOutcome`] by [`interpret`].

use std::fmt;

use tracing::trace;

use crate::Error;

/// Opaque provider-supplied data needed to resume an operation after
/// a user interaction.
///
/// The bridge never inspects nor mutates it: it is copied verbatim
/// into the retry call.
#[derive(Clone, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct ContinuationToken(
    #[cfg_attr(feature = "derive", serde(with = "crate::encoding::bytes"))] Vec<u8>,
);

impl ContinuationToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ContinuationToken {
    fn from(token: Vec<u8>) -> Self {
        Self(token)
    }
}

impl From<&[u8]> for ContinuationToken {
    fn from(token: &[u8]) -> Self {
        Self(token.to_vec())
    }
}

impl From<ContinuationToken> for Vec<u8> {
    fn from(token: ContinuationToken) -> Self {
        token.0
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({} bytes)", self.0.len())
    }
}

/// Opaque, UI-launchable token the host shell uses to present the
/// step the provider needs from the user.
#[derive(Clone, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct InteractionHandle(
    #[cfg_attr(feature = "derive", serde(with = "crate::encoding::bytes"))] Vec<u8>,
);

impl InteractionHandle {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for InteractionHandle {
    fn from(handle: Vec<u8>) -> Self {
        Self(handle)
    }
}

impl From<&[u8]> for InteractionHandle {
    fn from(handle: &[u8]) -> Self {
        Self(handle.to_vec())
    }
}

impl From<&str> for InteractionHandle {
    fn from(handle: &str) -> Self {
        Self(handle.as_bytes().to_vec())
    }
}

impl fmt::Debug for InteractionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InteractionHandle({} bytes)", self.0.len())
    }
}

/// The raw provider reply.
///
/// This is what comes back from the provider, before any
/// interpretation. An error code of `0` means no error.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct RawReply {
    pub error_code: i32,
    pub error_message: Option<String>,
    pub continuation: Option<ContinuationToken>,
    pub interaction: Option<InteractionHandle>,
    #[cfg_attr(feature = "derive", serde(with = "crate::encoding::option_bytes"))]
    pub output: Option<Vec<u8>>,
}

impl RawReply {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn error(code: i32, message: impl ToString) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn interaction_required(
        continuation: impl Into<ContinuationToken>,
        interaction: impl Into<InteractionHandle>,
    ) -> Self {
        Self {
            continuation: Some(continuation.into()),
            interaction: Some(interaction.into()),
            ..Self::default()
        }
    }
}

/// The classified outcome of a provider call.
#[derive(Debug)]
pub enum CallOutcome {
    /// The provider completed the call. The output bytes are owned by
    /// the outcome and handed over to the caller.
    Success { output: Vec<u8> },

    /// The call failed, either on the provider side or on the way to
    /// it.
    Failure(Error),

    /// The provider needs the user before it can go on.
    InteractionRequired {
        continuation: ContinuationToken,
        interaction: InteractionHandle,
    },
}

impl From<RawReply> for CallOutcome {
    fn from(reply: RawReply) -> Self {
        interpret(reply)
    }
}

/// Classifies a raw provider reply.
///
/// 1. A non-zero error code is a provider error, the message being
///    optional.
/// 2. A continuation together with an interaction handle requires an
///    interaction, whatever the output.
/// 3. Only one of continuation and interaction handle is a protocol
///    violation.
/// 4. Anything else is a success, which must come with an output.
pub fn interpret(reply: RawReply) -> CallOutcome {
    trace!(
        error_code = reply.error_code,
        continuation = reply.continuation.is_some(),
        interaction = reply.interaction.is_some(),
        output_len = ?reply.output.as_ref().map(Vec::len),
        "interpreting provider reply"
    );

    if reply.error_code != 0 {
        return CallOutcome::Failure(Error::ProviderError {
            code: reply.error_code,
            message: reply.error_message.unwrap_or_default(),
        });
    }

    match (reply.continuation, reply.interaction) {
        (Some(continuation), Some(interaction)) => CallOutcome::InteractionRequired {
            continuation,
            interaction,
        },
        (Some(_), None) => CallOutcome::Failure(Error::MalformedReplyError(String::from(
            "continuation token without interaction handle",
        ))),
        (None, Some(_)) => CallOutcome::Failure(Error::MalformedReplyError(String::from(
            "interaction handle without continuation token",
        ))),
        (None, None) => match reply.output {
            Some(output) => CallOutcome::Success { output },
            None => CallOutcome::Failure(Error::MalformedReplyError(String::from(
                "missing output on success",
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interaction_wins_over_output() {
        let reply = RawReply {
            output: Some(b"ignored".to_vec()),
            ..RawReply::interaction_required(b"token".to_vec(), "unlock-key")
        };

        match interpret(reply) {
            CallOutcome::InteractionRequired {
                continuation,
                interaction,
            } => {
                assert_eq!(continuation.as_bytes(), b"token");
                assert_eq!(interaction.as_bytes(), b"unlock-key");
            }
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }
    }

    #[test]
    fn provider_error() {
        match interpret(RawReply::error(13, "no public key")) {
            CallOutcome::Failure(Error::ProviderError { code, message }) => {
                assert_eq!(code, 13);
                assert_eq!(message, "no public key");
            }
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }

        // a missing message is not an error by itself
        let reply = RawReply {
            error_code: 2,
            ..RawReply::default()
        };
        match interpret(reply) {
            CallOutcome::Failure(Error::ProviderError { code, message }) => {
                assert_eq!(code, 2);
                assert!(message.is_empty());
            }
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }
    }

    #[test]
    fn success_requires_output() {
        match interpret(RawReply::success("-----BEGIN PGP MESSAGE-----")) {
            CallOutcome::Success { output } => {
                assert_eq!(output, b"-----BEGIN PGP MESSAGE-----")
            }
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }

        assert!(matches!(
            interpret(RawReply::default()),
            CallOutcome::Failure(Error::MalformedReplyError(_))
        ));

        // empty output is still an output
        assert!(matches!(
            interpret(RawReply::success(Vec::new())),
            CallOutcome::Success { output } if output.is_empty()
        ));
    }

    #[test]
    fn half_interaction_is_malformed() {
        let reply = RawReply {
            continuation: Some(b"token".to_vec().into()),
            output: Some(Vec::new()),
            ..RawReply::default()
        };
        assert!(matches!(
            interpret(reply),
            CallOutcome::Failure(Error::MalformedReplyError(_))
        ));

        let reply = RawReply {
            interaction: Some("unlock-key".into()),
            ..RawReply::default()
        };
        assert!(matches!(
            interpret(reply),
            CallOutcome::Failure(Error::MalformedReplyError(_))
        ));
    }
}
