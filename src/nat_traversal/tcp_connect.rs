/**
 * nat_traversal/tcp_connect.rs
 *
 * Port-sharing TCP sockets.
 *
 * The directory connection, the local listener and every candidate dial use
 * the same local port, so the mapping a NAT creates for the directory server
 * is the one the peer is told to dial. All of them set SO_REUSEADDR (and
 * SO_REUSEPORT on unix) before binding.
 */

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

use super::types::Endpoint;

const LISTEN_BACKLOG: i32 = 128;

/// TCP connection error
#[derive(Debug, Error)]
pub enum TcpConnectError {
    #[error("connection timeout")]
    Timeout,

    #[error("bind failed: {0}")]
    BindFailed(#[source] io::Error),

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
}

/// Pick the address advertised as the private endpoint: the first
/// non-loopback IPv4 address, or the IPv4 wildcard if there is none
pub fn select_private_ip(local_addrs: &[IpAddr]) -> IpAddr {
    local_addrs
        .iter()
        .copied()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Wildcard address of the same family as `addr`
fn unspecified_for(addr: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

/// Non-blocking TCP socket whose local port can be shared
fn reusable_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    Ok(socket)
}

/// Connect to `remote` from `local_port` (0 lets the OS choose), keeping the
/// local port shareable with a listener and later dials
pub async fn connect_reusable(
    local_port: u16,
    remote: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TcpConnectError> {
    let local = unspecified_for(&remote, local_port);

    let socket = reusable_socket(&remote).map_err(TcpConnectError::BindFailed)?;
    socket
        .bind(&local.into())
        .map_err(TcpConnectError::BindFailed)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    match tokio::time::timeout(timeout, socket.connect(remote)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TcpConnectError::ConnectFailed(e)),
        Err(_) => Err(TcpConnectError::Timeout),
    }
}

/// Dial a peer endpoint from the shared local port
///
/// Falls back to an ephemeral port when the shared one cannot be bound, so a
/// platform without port reuse can still reach peers that need no punching.
pub async fn dial(
    endpoint: Endpoint,
    local_port: u16,
    timeout: Duration,
) -> Result<TcpStream, TcpConnectError> {
    debug!(%endpoint, local_port, "dialing peer");

    match connect_reusable(local_port, endpoint.addr(), timeout).await {
        Err(TcpConnectError::BindFailed(e)) if local_port != 0 => {
            debug!(%endpoint, error = %e, "shared port unavailable, dialing from an ephemeral port");
            connect_reusable(0, endpoint.addr(), timeout).await
        }
        result => result,
    }
}

/// Listener for inbound peer connections on the advertised private endpoint
#[derive(Debug)]
pub struct LocalListener {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl LocalListener {
    /// Bind and listen on `endpoint`; must be called within a tokio runtime
    pub fn bind(endpoint: Endpoint) -> Result<Self, TcpConnectError> {
        let addr = endpoint.addr();

        let socket = reusable_socket(&addr).map_err(TcpConnectError::BindFailed)?;
        socket
            .bind(&addr.into())
            .map_err(TcpConnectError::BindFailed)?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(TcpConnectError::BindFailed)?;

        let listener = TcpListener::from_std(socket.into()).map_err(TcpConnectError::BindFailed)?;
        info!(%endpoint, "listening for peer connections");

        Ok(Self { listener, endpoint })
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
