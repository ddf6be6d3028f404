/**
 * nat_traversal/candidates.rs
 *
 * Candidate pool and the activate / confirm_activation handshake.
 *
 * Every connection that might become the chat channel (the private dial, the
 * public dial, each accepted socket) runs its handshake in its own task in a
 * `JoinSet`. The task owns the socket; the first task to finish successfully
 * hands it back to the controller, which then aborts the rest so their
 * sockets are closed.
 */

use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::tcp_connect::{self, TcpConnectError};
use super::types::{Endpoint, Provenance, Role};
use crate::messages::PeerMessage;
use crate::network::{LineCodec, LineCodecError};

pub type CandidateId = u64;

/// Line-framed TCP connection
pub type LineStream = Framed<TcpStream, LineCodec>;

/// Activation handshake errors
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("dial failed: {0}")]
    Dial(#[from] TcpConnectError),

    #[error("transport error: {0}")]
    Transport(#[from] LineCodecError),

    #[error("connection closed before activation")]
    Closed,

    #[error("unexpected activation message {0:?}")]
    Unexpected(String),
}

/// An open, unconfirmed connection to the peer
#[derive(Debug)]
pub struct Candidate {
    id: CandidateId,
    provenance: Provenance,
    peer_addr: SocketAddr,
    stream: LineStream,
}

impl Candidate {
    pub fn new(
        id: CandidateId,
        provenance: Provenance,
        stream: TcpStream,
        max_line_length: usize,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            id,
            provenance,
            peer_addr,
            stream: Framed::new(stream, LineCodec::with_max_length(max_line_length)),
        })
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Give up the candidate's connection to its new owner
    pub fn into_stream(self) -> LineStream {
        self.stream
    }

    /// Close a losing candidate
    pub fn close(self) {
        debug!(id = self.id, provenance = %self.provenance, peer = %self.peer_addr, "closing candidate");
    }

    async fn send(&mut self, message: PeerMessage) -> Result<(), ActivationError> {
        self.stream.send(message.to_string()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, ActivationError> {
        match self.stream.next().await {
            Some(line) => Ok(line?),
            None => Err(ActivationError::Closed),
        }
    }
}

/// Active side: propose the candidate and wait for the peer to accept it
pub async fn resolve_active(mut candidate: Candidate) -> Result<Candidate, ActivationError> {
    candidate.send(PeerMessage::Activate).await?;

    let line = candidate.receive().await?;
    match PeerMessage::parse(&line) {
        Ok(PeerMessage::ConfirmActivation) => Ok(candidate),
        _ => Err(ActivationError::Unexpected(line)),
    }
}

/// Passive side: wait for the peer to propose the candidate
///
/// The confirmation is written by the controller, and only on the winner.
pub async fn resolve_passive(mut candidate: Candidate) -> Result<Candidate, ActivationError> {
    let line = candidate.receive().await?;
    match PeerMessage::parse(&line) {
        Ok(PeerMessage::Activate) => Ok(candidate),
        _ => Err(ActivationError::Unexpected(line)),
    }
}

/// The handshake variant, fixed once from the client's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Active,
    Passive,
}

impl Handshake {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Active => Handshake::Active,
            Role::Passive => Handshake::Passive,
        }
    }

    pub async fn resolve(self, candidate: Candidate) -> Result<Candidate, ActivationError> {
        match self {
            Handshake::Active => resolve_active(candidate).await,
            Handshake::Passive => resolve_passive(candidate).await,
        }
    }
}

async fn dial_and_resolve(
    id: CandidateId,
    provenance: Provenance,
    endpoint: Endpoint,
    local_port: u16,
    timeout: Duration,
    handshake: Handshake,
    max_line_length: usize,
) -> Result<Candidate, ActivationError> {
    let stream = tcp_connect::dial(endpoint, local_port, timeout).await?;
    let candidate =
        Candidate::new(id, provenance, stream, max_line_length).map_err(LineCodecError::from)?;
    debug!(id, %provenance, peer = %candidate.peer_addr(), "dial connected");

    handshake.resolve(candidate).await
}

/// A finished candidate task
#[derive(Debug)]
pub struct CandidateOutcome {
    pub id: CandidateId,
    pub provenance: Provenance,
    pub result: Result<Candidate, ActivationError>,
}

/// Connections racing to become the chat channel
pub struct CandidatePool {
    handshake: Handshake,
    max_line_length: usize,
    tasks: JoinSet<CandidateOutcome>,
    next_id: CandidateId,
}

impl CandidatePool {
    pub fn new(handshake: Handshake, max_line_length: usize) -> Self {
        Self {
            handshake,
            max_line_length,
            tasks: JoinSet::new(),
            next_id: 0,
        }
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// Candidates still forming or handshaking
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Dial `endpoint` from the shared local port, then run the handshake
    pub fn spawn_dial(&mut self, endpoint: Endpoint, local_port: u16, timeout: Duration) -> CandidateId {
        let id = self.allocate_id();
        let provenance = Provenance::from(endpoint.kind());
        let handshake = self.handshake;
        let max_line_length = self.max_line_length;

        self.tasks.spawn(async move {
            let result = dial_and_resolve(
                id,
                provenance,
                endpoint,
                local_port,
                timeout,
                handshake,
                max_line_length,
            )
            .await;

            CandidateOutcome { id, provenance, result }
        });

        id
    }

    /// Run the handshake on an accepted connection
    pub fn spawn_accepted(&mut self, stream: TcpStream) -> CandidateId {
        let id = self.allocate_id();
        let provenance = Provenance::Accepted;
        let handshake = self.handshake;
        let max_line_length = self.max_line_length;

        self.tasks.spawn(async move {
            let result = match Candidate::new(id, provenance, stream, max_line_length) {
                Ok(candidate) => handshake.resolve(candidate).await,
                Err(e) => Err(LineCodecError::from(e).into()),
            };

            CandidateOutcome { id, provenance, result }
        });

        id
    }

    /// Next finished handshake, in completion order; `None` when the pool is empty
    pub async fn next_outcome(&mut self) -> Option<CandidateOutcome> {
        loop {
            match self.tasks.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(e) if e.is_panic() => warn!(error = %e, "candidate task panicked"),
                Err(_) => {}
            }
        }
    }

    /// Abort every remaining candidate and wait until their sockets are closed
    pub async fn close_all(&mut self) -> usize {
        let remaining = self.tasks.len();
        self.tasks.shutdown().await;
        if remaining > 0 {
            debug!(remaining, "closed losing candidates");
        }
        remaining
    }

    fn allocate_id(&mut self) -> CandidateId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
