#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Asynchronous Rust library to delegate PGP operations to an
//! external OpenPGP provider.
//!
//! The library never performs any cryptography by itself. It binds a
//! provider, sends it operation requests, and drives the interaction
//! rounds the provider may require (passphrase entry, key selection)
//! through the host shell, until the operation either succeeds or
//! fails. See [`PgpBridge`] to get started.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
#[cfg(feature = "derive")]
mod encoding;
mod error;
pub(crate) mod handler;
pub mod outcome;
pub mod provider;
pub mod request;

#[doc(inline)]
pub use self::{
    bridge::{BridgeBuilder, BridgeEvent, Operation, OperationState, PgpBridge},
    config::KeyConfiguration,
    correlator::{ModalResult, ModalStatus, RequestCode},
    error::{Error, Result},
    outcome::{CallOutcome, RawReply},
    request::{Action, OperationRequest, OperationRequestBuilder},
};
