/**
 * messages.rs
 *
 * Text messages exchanged with the directory server and with the peer
 */

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::network::is_terminator;

pub const CONNECT: &str = "connect";
pub const CONFIRM_CONNECTION: &str = "confirm_connection";
pub const GET_LIST: &str = "get_list";
pub const LIST: &str = "list";
pub const GET_INFO: &str = "get_info";
pub const INFO: &str = "info";
pub const ACTIVATE: &str = "activate";
pub const CONFIRM_ACTIVATION: &str = "confirm_activation";
pub const MESSAGE: &str = "message";

/// Malformed wire message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message `{0}`")]
    UnknownTitle(String),

    #[error("malformed `{title}` message: {line:?}")]
    Malformed { title: &'static str, line: String },
}

/// Split off the first space-delimited token: `(token, rest)`
pub fn split_token(line: &str) -> (&str, &str) {
    line.split_once(' ').unwrap_or((line, ""))
}

/// Split a line into tokens by repeatedly splitting on the first space
pub fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        let (token, tail) = split_token(rest);
        tokens.push(token);
        rest = tail;
    }
    tokens
}

/// Wire form of an endpoint: `<ip> <port>`
pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("{} {}", addr.ip(), addr.port())
}

/// Parse the `<ip> <port>` token pair
pub fn parse_endpoint(ip: &str, port: &str) -> Option<SocketAddr> {
    let ip: IpAddr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Replace characters that would end a frame early
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && is_terminator(c as u8) { ' ' } else { c })
        .collect()
}

/// Client to directory server requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest<'a> {
    Connect { name: &'a str, endpoint: SocketAddr },
    GetList,
    GetInfo { name: &'a str },
}

impl ServerRequest<'_> {
    pub fn title(&self) -> &'static str {
        match self {
            ServerRequest::Connect { .. } => CONNECT,
            ServerRequest::GetList => GET_LIST,
            ServerRequest::GetInfo { .. } => GET_INFO,
        }
    }
}

impl fmt::Display for ServerRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRequest::Connect { name, endpoint } => {
                write!(f, "{} {} {}", CONNECT, name, format_endpoint(*endpoint))
            }
            ServerRequest::GetList => f.write_str(GET_LIST),
            ServerRequest::GetInfo { name } => write!(f, "{} {}", GET_INFO, name),
        }
    }
}

/// Directory server to client replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    ConfirmConnection,
    List(Vec<String>),
    Info { private: SocketAddr, public: SocketAddr },
    /// Anything else; carries the whole line
    Other(String),
}

impl ServerReply {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens = tokenize(line);
        let Some((&title, fields)) = tokens.split_first() else {
            return Err(ProtocolError::Empty);
        };

        match title {
            CONFIRM_CONNECTION if fields.is_empty() => Ok(ServerReply::ConfirmConnection),
            LIST => Ok(ServerReply::List(
                fields
                    .iter()
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
                    .collect(),
            )),
            INFO => {
                let malformed = || ProtocolError::Malformed {
                    title: INFO,
                    line: line.to_string(),
                };
                let [private_ip, private_port, public_ip, public_port] = fields else {
                    return Err(malformed());
                };
                let private = parse_endpoint(private_ip, private_port).ok_or_else(malformed)?;
                let public = parse_endpoint(public_ip, public_port).ok_or_else(malformed)?;
                Ok(ServerReply::Info { private, public })
            }
            _ => Ok(ServerReply::Other(line.to_string())),
        }
    }
}

/// Peer to peer messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Activate,
    ConfirmActivation,
    Chat { sender: String, text: String },
}

impl PeerMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (title, rest) = split_token(line);
        match title {
            "" => Err(ProtocolError::Empty),
            ACTIVATE if rest.is_empty() => Ok(PeerMessage::Activate),
            CONFIRM_ACTIVATION if rest.is_empty() => Ok(PeerMessage::ConfirmActivation),
            MESSAGE => {
                // The text keeps its inner spaces
                let (sender, text) = split_token(rest);
                if sender.is_empty() || text.is_empty() {
                    return Err(ProtocolError::Malformed {
                        title: MESSAGE,
                        line: line.to_string(),
                    });
                }
                Ok(PeerMessage::Chat {
                    sender: sender.to_string(),
                    text: text.to_string(),
                })
            }
            _ => Err(ProtocolError::UnknownTitle(line.to_string())),
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::Activate => f.write_str(ACTIVATE),
            PeerMessage::ConfirmActivation => f.write_str(CONFIRM_ACTIVATION),
            PeerMessage::Chat { sender, text } => write!(f, "{} {} {}", MESSAGE, sender, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_each_space() {
        assert!(tokenize("").is_empty());
        assert_eq!(tokenize("get_list"), vec!["get_list"]);
        assert_eq!(tokenize("list alice bob"), vec!["list", "alice", "bob"]);
        assert_eq!(tokenize("a  b"), vec!["a", "", "b"]);
    }

    #[test]
    fn requests_format_like_the_directory_expects() {
        let endpoint: SocketAddr = "192.168.1.20:40123".parse().unwrap();
        assert_eq!(
            ServerRequest::Connect { name: "alice", endpoint }.to_string(),
            "connect alice 192.168.1.20 40123"
        );
        assert_eq!(ServerRequest::GetList.to_string(), "get_list");
        assert_eq!(
            ServerRequest::GetInfo { name: "bob" }.to_string(),
            "get_info bob"
        );
    }

    #[test]
    fn parses_server_replies() {
        assert_eq!(
            ServerReply::parse("confirm_connection"),
            Ok(ServerReply::ConfirmConnection)
        );
        assert_eq!(ServerReply::parse("list"), Ok(ServerReply::List(vec![])));
        assert_eq!(
            ServerReply::parse("list alice bob"),
            Ok(ServerReply::List(vec!["alice".into(), "bob".into()]))
        );
        assert_eq!(
            ServerReply::parse("info 10.0.0.2 4000 203.0.113.7 61000"),
            Ok(ServerReply::Info {
                private: "10.0.0.2:4000".parse().unwrap(),
                public: "203.0.113.7:61000".parse().unwrap(),
            })
        );
        assert_eq!(
            ServerReply::parse("confirm_connection extra"),
            Ok(ServerReply::Other("confirm_connection extra".into()))
        );
        assert_eq!(
            ServerReply::parse("unknown_user"),
            Ok(ServerReply::Other("unknown_user".into()))
        );
        assert_eq!(ServerReply::parse(""), Err(ProtocolError::Empty));
    }

    #[test]
    fn rejects_malformed_info() {
        for line in ["info 10.0.0.2 4000", "info a b c d", "info 10.0.0.2 70000 1.2.3.4 5"] {
            assert!(matches!(
                ServerReply::parse(line),
                Err(ProtocolError::Malformed { title: INFO, .. })
            ));
        }
    }

    #[test]
    fn parses_peer_messages() {
        assert_eq!(PeerMessage::parse("activate"), Ok(PeerMessage::Activate));
        assert_eq!(
            PeerMessage::parse("confirm_activation"),
            Ok(PeerMessage::ConfirmActivation)
        );
        assert_eq!(
            PeerMessage::parse("message bob hi there"),
            Ok(PeerMessage::Chat {
                sender: "bob".into(),
                text: "hi there".into()
            })
        );
    }

    #[test]
    fn chat_needs_sender_and_text() {
        for line in ["message alice", "message", "message  hi"] {
            assert!(matches!(
                PeerMessage::parse(line),
                Err(ProtocolError::Malformed { title: MESSAGE, .. })
            ));
        }
        assert!(matches!(
            PeerMessage::parse("activate now"),
            Err(ProtocolError::UnknownTitle(_))
        ));
    }

    #[test]
    fn chat_formats_with_sender() {
        let msg = PeerMessage::Chat {
            sender: "bob".into(),
            text: "hi".into(),
        };
        assert_eq!(msg.to_string(), "message bob hi");
    }

    #[test]
    fn sanitize_replaces_terminators() {
        assert_eq!(sanitize_text("a\tb\r\nc"), "a b  c");
        assert_eq!(sanitize_text("héllo wörld"), "héllo wörld");
    }
}
