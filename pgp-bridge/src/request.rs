//! # Request
//!
//! Module dedicated to operation requests. It contains the immutable
//! [`OperationRequest`] submitted to the bridge, its
//! [`OperationRequestBuilder`] and the [`ActionDescriptor`], which is
//! the provider-facing view of a request.

use std::fmt;

use tracing::trace;

use crate::{config::KeyConfiguration, outcome::ContinuationToken, Error, Result};

/// The PGP action to perform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum Action {
    Sign,
    Encrypt,
    SignAndEncrypt,
    Decrypt,
}

impl Action {
    /// Returns `true` if the action needs at least one recipient.
    pub fn requires_recipients(&self) -> bool {
        matches!(self, Self::Encrypt | Self::SignAndEncrypt)
    }

    /// Returns `true` if the action produces a signature.
    pub fn signs(&self) -> bool {
        matches!(self, Self::Sign | Self::SignAndEncrypt)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sign => write!(f, "sign"),
            Self::Encrypt => write!(f, "encrypt"),
            Self::SignAndEncrypt => write!(f, "sign-and-encrypt"),
            Self::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// The operation request.
///
/// A request is immutable once built: the only way to get one is
/// through the [`OperationRequestBuilder`], which validates it. The
/// payload is owned by the request and therefore by the operation in
/// flight.
#[derive(Clone, Eq, PartialEq)]
pub struct OperationRequest {
    action: Action,
    recipients: Vec<String>,
    ascii_armor: bool,
    sign_key_id: Option<u64>,
    payload: Vec<u8>,
}

impl OperationRequest {
    pub fn builder(action: Action) -> OperationRequestBuilder {
        OperationRequestBuilder::new(action)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn ascii_armor(&self) -> bool {
        self.ascii_armor
    }

    pub fn sign_key_id(&self) -> Option<u64> {
        self.sign_key_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Builds the provider-facing descriptor of this request.
    ///
    /// The first call of an operation carries neither continuation
    /// nor interaction result. Retry calls carry the continuation
    /// token verbatim, along with the data returned by the host.
    pub fn descriptor(
        &self,
        continuation: Option<ContinuationToken>,
        interaction_result: Option<Vec<u8>>,
    ) -> ActionDescriptor {
        ActionDescriptor {
            action: self.action,
            recipients: self.recipients.clone(),
            ascii_armor: self.ascii_armor,
            sign_key_id: self.sign_key_id,
            continuation,
            interaction_result,
        }
    }
}

// payloads may be large and sensitive, only their size is shown
impl fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRequest")
            .field("action", &self.action)
            .field("recipients", &self.recipients)
            .field("ascii_armor", &self.ascii_armor)
            .field("sign_key_id", &self.sign_key_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// The operation request builder.
///
/// Pure and synchronous: building a request never performs any I/O.
#[derive(Clone, Debug)]
pub struct OperationRequestBuilder {
    action: Action,
    recipients: Vec<String>,
    ascii_armor: bool,
    sign_key_id: Option<u64>,
    self_recipient: Option<String>,
    encrypt_to_self: bool,
    payload: Vec<u8>,
}

impl OperationRequestBuilder {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            recipients: Vec::new(),
            ascii_armor: true,
            sign_key_id: None,
            self_recipient: None,
            encrypt_to_self: false,
            payload: Vec::new(),
        }
    }

    pub fn with_recipient(mut self, recipient: impl ToString) -> Self {
        self.recipients.push(recipient.to_string());
        self
    }

    pub fn with_recipients<R, I>(mut self, recipients: I) -> Self
    where
        R: ToString,
        I: IntoIterator<Item = R>,
    {
        for recipient in recipients {
            self.recipients.push(recipient.to_string());
        }
        self
    }

    pub fn with_ascii_armor(mut self, armor: bool) -> Self {
        self.ascii_armor = armor;
        self
    }

    pub fn with_sign_key_id(mut self, key_id: u64) -> Self {
        self.sign_key_id = Some(key_id);
        self
    }

    /// Adds the sender to the recipients of encrypting actions, so
    /// that the sender can read back what was encrypted.
    ///
    /// Only effective along with [`Self::with_key_config`].
    pub fn with_encrypt_to_self(mut self, encrypt_to_self: bool) -> Self {
        self.encrypt_to_self = encrypt_to_self;
        self
    }

    /// Applies the key configuration: the configured key signs, and
    /// the default user id becomes the self recipient.
    pub fn with_key_config(mut self, config: &KeyConfiguration) -> Self {
        if let Some(key_id) = config.key_id() {
            self.sign_key_id = Some(key_id);
        }
        self.self_recipient = Some(config.default_user_id().to_owned());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(self) -> Result<OperationRequest> {
        let mut recipients = Vec::with_capacity(self.recipients.len() + 1);

        let self_recipient = match self.self_recipient {
            Some(recipient) if self.action.requires_recipients() && self.encrypt_to_self => {
                recipients.push(recipient.clone());
                Some(recipient)
            }
            _ => None,
        };

        // caller recipients are kept as given, only the self recipient
        // is not repeated
        for recipient in self.recipients {
            if recipient.trim().is_empty() {
                return Err(Error::InvalidRequestError(String::from(
                    "recipient id cannot be blank",
                )));
            }
            if self_recipient.as_ref() != Some(&recipient) {
                recipients.push(recipient);
            }
        }

        if self.action.requires_recipients() && recipients.is_empty() {
            return Err(Error::InvalidRequestError(format!(
                "{} requires at least one recipient",
                self.action
            )));
        }

        let sign_key_id = if self.action.signs() {
            self.sign_key_id
        } else {
            None
        };

        trace!(
            action = %self.action,
            recipients = recipients.len(),
            payload_len = self.payload.len(),
            "built operation request"
        );

        Ok(OperationRequest {
            action: self.action,
            recipients,
            ascii_armor: self.ascii_armor,
            sign_key_id,
            payload: self.payload,
        })
    }
}

/// The action descriptor.
///
/// Describes what the provider should do. The payload itself travels
/// separately, as an input byte stream.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct ActionDescriptor {
    pub action: Action,
    pub recipients: Vec<String>,
    pub ascii_armor: bool,
    #[cfg_attr(feature = "derive", serde(default))]
    pub sign_key_id: Option<u64>,

    /// The continuation token of the previous round, copied verbatim.
    #[cfg_attr(feature = "derive", serde(default))]
    pub continuation: Option<ContinuationToken>,

    /// The data returned by the host at the end of the previous
    /// interaction round.
    #[cfg_attr(
        feature = "derive",
        serde(default, with = "crate::encoding::option_bytes")
    )]
    pub interaction_result: Option<Vec<u8>>,
}
