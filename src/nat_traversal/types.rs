/**
 * nat_traversal/types.rs
 *
 * Core types for rendezvous and connection racing
 */

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::relay;
use crate::network::DEFAULT_MAX_LINE_LENGTH;

/// Where an endpoint was learned from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// The host's own network address
    Private,

    /// The address the directory server sees
    Public,
}

/// A peer address tagged with its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
    kind: EndpointKind,
}

impl Endpoint {
    pub fn private(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: EndpointKind::Private,
        }
    }

    pub fn public(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: EndpointKind::Public,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EndpointKind::Private => write!(f, "private {}", self.addr),
            EndpointKind::Public => write!(f, "public {}", self.addr),
        }
    }
}

/// Peer connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub private: Endpoint,
    pub public: Endpoint,
}

/// Client state machine
///
/// `Connecting -> Registering -> { Idle | WaitingForFriend -> LookingUpFriend
/// -> Racing -> Communicating } -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Connecting,
    Registering,
    Idle,
    WaitingForFriend,
    LookingUpFriend,
    Racing,
    Communicating,
    Closed,
}

impl ClientState {
    /// Whether a fresh connection to the peer may join the race in this state
    pub fn accepts_candidates(self, role: Role) -> bool {
        match role {
            Role::Passive => self == ClientState::Idle,
            Role::Active => matches!(
                self,
                ClientState::WaitingForFriend | ClientState::LookingUpFriend | ClientState::Racing
            ),
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Connecting => "connecting",
            ClientState::Registering => "registering",
            ClientState::Idle => "idle",
            ClientState::WaitingForFriend => "waiting for friend",
            ClientState::LookingUpFriend => "looking up friend",
            ClientState::Racing => "racing",
            ClientState::Communicating => "communicating",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the activation handshake this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started with a target name; sends `activate`
    Active,

    /// Waits to be discovered; answers `activate`
    Passive,
}

impl Role {
    pub fn for_target(friend_name: Option<&str>) -> Self {
        match friend_name {
            Some(_) => Role::Active,
            None => Role::Passive,
        }
    }
}

/// How a candidate connection came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    DialedPrivate,
    DialedPublic,
    Accepted,
}

impl From<EndpointKind> for Provenance {
    fn from(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Private => Provenance::DialedPrivate,
            EndpointKind::Public => Provenance::DialedPublic,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provenance::DialedPrivate => "dialed-private",
            Provenance::DialedPublic => "dialed-public",
            Provenance::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

/// Chat client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name registered with the directory server
    pub name: String,

    /// Directory server address
    pub server_addr: SocketAddr,

    /// Peer to look up; `None` only registers and waits
    pub friend_name: Option<String>,

    /// Host interface addresses, searched for the private endpoint
    pub local_addrs: Vec<IpAddr>,

    /// Delay before re-polling `get_list` when the friend is absent
    pub poll_interval: Duration,

    /// Connect timeout for the directory server and each candidate dial
    pub dial_timeout: Duration,

    /// Outgoing chat messages kept while a write is in flight
    pub queue_capacity: usize,

    /// Longest accepted line, in bytes
    pub max_line_length: usize,

    /// Tear the session down when a passive candidate opens with anything
    /// other than `activate`, instead of discarding that candidate
    pub strict_activation: bool,
}

impl ClientConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_QUEUE_CAPACITY: usize = relay::DEFAULT_QUEUE_CAPACITY;

    pub fn new(name: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            server_addr,
            friend_name: None,
            local_addrs: Vec::new(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            dial_timeout: Self::DEFAULT_DIAL_TIMEOUT,
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            strict_activation: false,
        }
    }

    pub fn with_friend(mut self, friend_name: impl Into<String>) -> Self {
        self.friend_name = Some(friend_name.into());
        self
    }

    pub fn role(&self) -> Role {
        Role::for_target(self.friend_name.as_deref())
    }
}
