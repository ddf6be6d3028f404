/**
 * nat_traversal/relay.rs
 *
 * The confirmed peer connection: inbound chat dispatch and the bounded
 * outbound queue.
 */

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use super::candidates::Candidate;
use crate::messages::{PeerMessage, ProtocolError, MESSAGE};
use crate::network::{LineCodec, LineCodecError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

type ReadHalf = FramedRead<OwnedReadHalf, LineCodec>;
type WriteHalf = FramedWrite<OwnedWriteHalf, LineCodec>;
type WriteFuture = BoxFuture<'static, (WriteHalf, Result<(), LineCodecError>)>;

/// Bounded FIFO of outgoing messages
///
/// Pushing onto a full queue evicts the oldest entry and hands it back.
/// The message being written is popped when its write starts, so it does not
/// count against `capacity`: a relay can hold `capacity + 1` pending messages.
#[derive(Debug, Clone)]
pub struct OutputQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> OutputQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

/// Relay errors; all of them end the session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("read failed: {0}")]
    Read(#[source] LineCodecError),

    #[error("write failed: {0}")]
    Write(#[source] LineCodecError),

    #[error("malformed message from peer: {0}")]
    Malformed(#[from] ProtocolError),
}

#[derive(Debug)]
pub enum RelayEvent {
    Message { sender: String, text: String },

    /// The peer closed the connection
    Closed,

    Failed(RelayError),
}

/// The single live chat connection
pub struct RelayChannel {
    peer_addr: SocketAddr,
    reader: ReadHalf,
    writer: Option<WriteHalf>,
    in_flight: Option<WriteFuture>,
    control: Option<PeerMessage>,
    queue: OutputQueue<PeerMessage>,
}

impl RelayChannel {
    /// Take over a promoted candidate's connection
    pub fn new(candidate: Candidate, queue_capacity: usize) -> Self {
        let peer_addr = candidate.peer_addr();
        let parts = candidate.into_stream().into_parts();
        let (read_half, write_half) = parts.io.into_split();

        // Bytes the peer sent right after the handshake line are already buffered
        let mut reader = FramedRead::new(read_half, parts.codec.clone());
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let writer = FramedWrite::new(write_half, parts.codec);

        Self {
            peer_addr,
            reader,
            writer: Some(writer),
            in_flight: None,
            control: None,
            queue: OutputQueue::new(queue_capacity),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a chat message; returns the message evicted to make room
    pub fn enqueue(&mut self, message: PeerMessage) -> Option<PeerMessage> {
        self.queue.push(message)
    }

    /// Write a handshake message ahead of any queued chat
    pub fn send_control(&mut self, message: PeerMessage) {
        self.control = Some(message);
    }

    pub fn is_writing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queue(&self) -> &OutputQueue<PeerMessage> {
        &self.queue
    }

    /// Drive pending writes and wait for the next inbound event
    ///
    /// Cancel safe: all progress lives in `self`.
    pub async fn next_event(&mut self) -> RelayEvent {
        loop {
            self.start_write();

            tokio::select! {
                biased;

                (writer, result) = wait_write(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.writer = Some(writer);
                    if let Err(e) = result {
                        return RelayEvent::Failed(RelayError::Write(e));
                    }
                    trace!(queued = self.queue.len(), "write completed");
                }

                line = self.reader.next() => {
                    return match line {
                        None => RelayEvent::Closed,
                        Some(Err(e)) => RelayEvent::Failed(RelayError::Read(e)),
                        Some(Ok(line)) => parse_chat(&line),
                    };
                }
            }
        }
    }

    /// Start writing the next message if nothing is in flight
    fn start_write(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(message) = self.control.take().or_else(|| self.queue.pop()) else {
            return;
        };
        let Some(mut writer) = self.writer.take() else {
            return;
        };

        let line = message.to_string();
        debug!(peer = %self.peer_addr, remaining = self.queue.len(), "writing to peer");
        self.in_flight = Some(Box::pin(async move {
            let result = writer.send(line).await;
            (writer, result)
        }));
    }
}

async fn wait_write(in_flight: &mut Option<WriteFuture>) -> (WriteHalf, Result<(), LineCodecError>) {
    match in_flight {
        Some(write) => write.await,
        None => std::future::pending().await,
    }
}

fn parse_chat(line: &str) -> RelayEvent {
    match PeerMessage::parse(line) {
        Ok(PeerMessage::Chat { sender, text }) => RelayEvent::Message { sender, text },
        Ok(_) => RelayEvent::Failed(RelayError::Malformed(ProtocolError::Malformed {
            title: MESSAGE,
            line: line.to_string(),
        })),
        Err(e) => RelayEvent::Failed(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::types::Provenance;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn relay_pair(capacity: usize) -> (RelayChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (remote, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let candidate = Candidate::new(0, Provenance::Accepted, accepted.unwrap().0, 8192).unwrap();
        (RelayChannel::new(candidate, capacity), remote.unwrap())
    }

    fn chat(text: &str) -> PeerMessage {
        PeerMessage::Chat {
            sender: "alice".into(),
            text: text.into(),
        }
    }

    #[test]
    fn queue_keeps_the_newest_entries() {
        let mut queue = OutputQueue::new(16);
        let evicted: Vec<usize> = (0..20).filter_map(|i| queue.push(i)).collect();

        assert_eq!(evicted, vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 16);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), (4..20).collect::<Vec<_>>());
        assert_eq!(queue.pop(), Some(4));
    }

    #[tokio::test]
    async fn drains_in_fifo_order_after_the_control_message() {
        let (mut relay, mut remote) = relay_pair(16).await;

        relay.send_control(PeerMessage::ConfirmActivation);
        for text in ["one", "two", "three"] {
            assert!(relay.enqueue(chat(text)).is_none());
        }

        let expected = b"confirm_activation\r\nmessage alice one\r\nmessage alice two\r\nmessage alice three\r\n";
        let reader = async {
            let mut buf = vec![0u8; expected.len()];
            remote.read_exact(&mut buf).await.unwrap();
            buf
        };

        // The relay only writes while it is being polled
        let buf = tokio::select! {
            buf = reader => buf,
            event = relay.next_event() => panic!("unexpected event {event:?}"),
        };
        assert_eq!(&buf[..], &expected[..]);
        assert!(relay.queue().is_empty());
    }

    #[tokio::test]
    async fn delivers_chat_and_reports_eof() {
        let (mut relay, mut remote) = relay_pair(16).await;

        remote.write_all(b"message bob hello there\r\n").await.unwrap();
        match relay.next_event().await {
            RelayEvent::Message { sender, text } => {
                assert_eq!(sender, "bob");
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(remote);
        assert!(matches!(relay.next_event().await, RelayEvent::Closed));
    }

    #[tokio::test]
    async fn malformed_chat_fails_the_relay() {
        let (mut relay, mut remote) = relay_pair(16).await;

        remote.write_all(b"message alice\r\n").await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), relay.next_event())
            .await
            .unwrap();
        assert!(matches!(event, RelayEvent::Failed(RelayError::Malformed(_))));
    }

    #[tokio::test]
    async fn stray_handshake_message_is_malformed() {
        let (mut relay, mut remote) = relay_pair(16).await;

        remote.write_all(b"activate\r\n").await.unwrap();
        assert!(matches!(
            relay.next_event().await,
            RelayEvent::Failed(RelayError::Malformed(_))
        ));
    }
}
