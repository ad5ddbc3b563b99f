//! # TCP provider
//!
//! This module contains the implementation of the TCP provider, based
//! on [`tokio::net::TcpStream`]. It reaches a provider daemon that
//! exchanges one JSON object per line, one connection per exchange.

use std::io;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
};
use tracing::{debug, info, trace};

use super::{Provider, ProviderHandle};
use crate::{outcome::RawReply, request::ActionDescriptor};

/// The request sent to a provider daemon.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ProviderRequest {
    #[serde(rename_all = "kebab-case")]
    Bind { service_id: String },
    #[serde(rename_all = "kebab-case")]
    Call {
        session: u64,
        service_id: String,
        descriptor: ActionDescriptor,
        #[serde(with = "crate::encoding::bytes")]
        input: Vec<u8>,
    },
    #[serde(rename_all = "kebab-case")]
    Unbind { session: u64, service_id: String },
}

/// The response sent back by a provider daemon.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ProviderResponse {
    Bound { session: u64 },
    Refused { reason: String },
    Reply { reply: RawReply },
    Unbound,
}

/// Line-based JSON stream over a TCP connection.
///
/// Used by the [`TcpProvider`] on the client side, and usable by
/// provider daemons on the server side.
pub struct TcpHandler {
    pub reader: BufReader<ReadHalf<TcpStream>>,
    pub writer: WriteHalf<TcpStream>,
}

impl TcpHandler {
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        Ok(Self::from(TcpStream::connect((host, port)).await?))
    }

    /// Reads the next JSON line.
    ///
    /// A closed connection is reported as
    /// [`io::ErrorKind::UnexpectedEof`], a line that cannot be parsed
    /// as [`io::ErrorKind::InvalidData`].
    pub async fn read<T: DeserializeOwned>(&mut self) -> io::Result<T> {
        let mut line = String::new();
        let count = self.reader.read_line(&mut line).await?;

        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of line",
            ));
        }

        trace!(len = count, "receiving line");

        serde_json::from_str(line.trim_end())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Writes the given value as a JSON line.
    pub async fn write<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(value)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        line.push(b'\n');

        trace!(len = line.len(), "sending line");

        self.writer.write_all(&line).await?;
        self.writer.flush().await
    }
}

impl From<TcpStream> for TcpHandler {
    fn from(stream: TcpStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let reader = BufReader::new(reader);
        Self { reader, writer }
    }
}

/// The TCP provider.
///
/// This [`Provider`] connects to a provider daemon listening on the
/// given host and port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpProvider {
    /// The TCP host the provider daemon listens on.
    pub host: String,

    /// The TCP port the provider daemon listens on.
    pub port: u16,
}

impl TcpProvider {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    async fn exchange(&self, req: &ProviderRequest) -> io::Result<ProviderResponse> {
        let mut handler = TcpHandler::connect(&self.host, self.port).await?;
        handler.write(req).await?;
        handler.read().await
    }
}

fn unexpected(res: ProviderResponse) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected provider response: {res:?}"),
    )
}

#[async_trait]
impl Provider for TcpProvider {
    async fn bind(&self, service_id: &str) -> io::Result<ProviderHandle> {
        info!(host = self.host, port = self.port, service = service_id, "bind tcp provider");

        let req = ProviderRequest::Bind {
            service_id: service_id.to_owned(),
        };

        match self.exchange(&req).await? {
            ProviderResponse::Bound { session } => {
                debug!(session, "tcp provider bound");
                Ok(ProviderHandle::new(session, service_id))
            }
            ProviderResponse::Refused { reason } => {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason))
            }
            res => Err(unexpected(res)),
        }
    }

    async fn call(
        &self,
        handle: &ProviderHandle,
        descriptor: &ActionDescriptor,
        input: Vec<u8>,
    ) -> io::Result<RawReply> {
        debug!(session = handle.session(), action = %descriptor.action, "call tcp provider");

        let req = ProviderRequest::Call {
            session: handle.session(),
            service_id: handle.service_id().to_owned(),
            descriptor: descriptor.clone(),
            input,
        };

        match self.exchange(&req).await? {
            ProviderResponse::Reply { reply } => Ok(reply),
            res => Err(unexpected(res)),
        }
    }

    async fn unbind(&self, handle: &ProviderHandle) -> io::Result<()> {
        info!(session = handle.session(), "unbind tcp provider");

        let req = ProviderRequest::Unbind {
            session: handle.session(),
            service_id: handle.service_id().to_owned(),
        };

        match self.exchange(&req).await? {
            ProviderResponse::Unbound => Ok(()),
            res => Err(unexpected(res)),
        }
    }
}
