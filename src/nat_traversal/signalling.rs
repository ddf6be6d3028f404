/**
 * nat_traversal/signalling.rs
 *
 * Directory server session: registration, roster polling and peer lookup
 */

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::tcp_connect::TcpConnectError;
use super::types::{Endpoint, PeerInfo};
use crate::messages::{ProtocolError, ServerReply, ServerRequest};
use crate::network::{LineCodec, LineCodecError};

/// Signalling session errors
#[derive(Debug, Error)]
pub enum SignallingError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[from] TcpConnectError),

    #[error("registration failed: {0:?}")]
    RegistrationFailed(String),

    #[error("send failed: {0}")]
    SendFailed(#[source] LineCodecError),

    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] LineCodecError),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ProtocolError),

    #[error("unexpected reply to `{request}`: {reply:?}")]
    UnexpectedReply { request: &'static str, reply: String },

    #[error("directory server closed the connection")]
    Closed,
}

/// The single connection to the directory server
pub struct RendezvousSession<S = TcpStream> {
    framed: Framed<S, LineCodec>,
    name: String,
}

impl<S> RendezvousSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, name: impl Into<String>, max_line_length: usize) -> Self {
        Self {
            framed: Framed::new(stream, LineCodec::with_max_length(max_line_length)),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register our name and private endpoint
    pub async fn register(&mut self, private: &Endpoint) -> Result<(), SignallingError> {
        let line = ServerRequest::Connect {
            name: &self.name,
            endpoint: private.addr(),
        }
        .to_string();
        self.send_line(line).await?;

        // Wait for ack
        match self.receive_reply().await? {
            (ServerReply::ConfirmConnection, _) => Ok(()),
            (_, line) => Err(SignallingError::RegistrationFailed(line)),
        }
    }

    /// Poll the roster once; true when `target` is online
    pub async fn fetch_roster(&mut self, target: &str) -> Result<bool, SignallingError> {
        self.send_line(ServerRequest::GetList.to_string()).await?;

        match self.receive_reply().await? {
            (ServerReply::List(names), _) => {
                debug!(online = names.len(), "roster received");
                Ok(names.iter().any(|name| name == target))
            }
            (_, line) => Err(SignallingError::UnexpectedReply {
                request: ServerRequest::GetList.title(),
                reply: line,
            }),
        }
    }

    /// Ask for `target`'s endpoints; `None` when the reply is not `info`
    pub async fn fetch_info(&mut self, target: &str) -> Result<Option<PeerInfo>, SignallingError> {
        self.send_line(ServerRequest::GetInfo { name: target }.to_string())
            .await?;

        match self.receive_reply().await? {
            (ServerReply::Info { private, public }, _) => Ok(Some(PeerInfo {
                name: target.to_string(),
                private: Endpoint::private(private),
                public: Endpoint::public(public),
            })),
            (_, line) => {
                debug!(reply = %line, "peer info unavailable");
                Ok(None)
            }
        }
    }

    /// Shut down the connection
    pub async fn close(self) -> Result<(), SignallingError> {
        let mut stream = self.framed.into_inner();
        stream
            .shutdown()
            .await
            .map_err(|e| SignallingError::SendFailed(e.into()))
    }

    async fn send_line(&mut self, line: String) -> Result<(), SignallingError> {
        debug!(request = %line, "sending to directory server");
        self.framed
            .send(line)
            .await
            .map_err(SignallingError::SendFailed)
    }

    async fn receive_reply(&mut self) -> Result<(ServerReply, String), SignallingError> {
        let line = self
            .framed
            .next()
            .await
            .ok_or(SignallingError::Closed)?
            .map_err(SignallingError::ReceiveFailed)?;

        debug!(reply = %line, "directory server replied");
        let reply = ServerReply::parse(&line)?;
        Ok((reply, line))
    }
}
