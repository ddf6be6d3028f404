/**
 * nat_traversal/mod.rs
 *
 * Client controller implementing:
 * - directory server registration and friend lookup
 * - concurrent private/public dials racing inbound connections
 * - activate / confirm_activation election of a single chat channel
 * - the chat relay with its bounded output queue
 *
 * One task owns the state and every socket; the `ClientHandle` talks to it
 * over a command channel.
 */

mod candidates;
mod relay;
mod signalling;
mod tcp_connect;
mod types;

pub use candidates::{
    resolve_active, resolve_passive, ActivationError, Candidate, CandidateId, CandidateOutcome,
    CandidatePool, Handshake, LineStream,
};
pub use relay::{OutputQueue, RelayChannel, RelayError, RelayEvent, DEFAULT_QUEUE_CAPACITY};
pub use signalling::{RendezvousSession, SignallingError};
pub use tcp_connect::{connect_reusable, dial, select_private_ip, LocalListener, TcpConnectError};
pub use types::{ClientConfig, ClientState, Endpoint, EndpointKind, PeerInfo, Provenance, Role};

use futures_util::future::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::messages::{sanitize_text, PeerMessage};

/// Notifications for the display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ClientState),
    PeerDiscovered(PeerInfo),
    Message { sender: String, text: String },
    /// Evicted from a full output queue before it was written
    MessageLost(String),
}

#[derive(Debug)]
enum Command {
    Send(String),
    Shutdown,
}

/// Errors that end the session
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("directory server: {0}")]
    Signalling(#[from] SignallingError),

    #[error("listener: {0}")]
    Listener(#[source] TcpConnectError),

    #[error("activation: {0}")]
    Activation(#[from] ActivationError),

    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("not connected to a peer (state: {0})")]
    NotCommunicating(ClientState),

    #[error("client is closed")]
    Closed,
}

/// Cloneable handle to a running client
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
}

impl ClientHandle {
    /// Queue a chat message; only accepted while communicating
    pub fn send_message(&self, text: impl Into<String>) -> Result<(), SendError> {
        let state = self.state();
        if state != ClientState::Communicating {
            warn!(%state, "not communicating, message rejected");
            return Err(SendError::NotCommunicating(state));
        }
        self.commands
            .send(Command::Send(text.into()))
            .map_err(|_| SendError::Closed)
    }

    /// Ask the client to close everything; safe to call repeatedly
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `predicate`; `None` if the client is gone
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ClientState) -> bool,
    ) -> Option<ClientState> {
        let mut state = self.state.clone();
        let result = state.wait_for(predicate).await.ok().map(|state| *state);
        result
    }
}

/// Request issued to the directory server
#[derive(Debug)]
enum Request {
    Register(Endpoint),
    Roster { target: String, delay: Duration },
    Info(String),
}

#[derive(Debug)]
enum Reply {
    Registered,
    Roster(bool),
    Info(Option<PeerInfo>),
}

type StepResult = (RendezvousSession, Result<Reply, SignallingError>);

/// An in-flight directory request
///
/// The step owns the session until it completes, and remembers the state it
/// was issued in.
struct RendezvousStep {
    issued_in: ClientState,
    future: BoxFuture<'static, StepResult>,
}

async fn run_step(mut session: RendezvousSession, request: Request) -> StepResult {
    let result = match request {
        Request::Register(private) => session.register(&private).await.map(|()| Reply::Registered),
        Request::Roster { target, delay } => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            session.fetch_roster(&target).await.map(Reply::Roster)
        }
        Request::Info(target) => session.fetch_info(&target).await.map(Reply::Info),
    };
    (session, result)
}

async fn next_step(step: &mut Option<RendezvousStep>) -> (ClientState, StepResult) {
    match step {
        Some(step) => (step.issued_in, (&mut step.future).await),
        None => std::future::pending().await,
    }
}

async fn next_accept(listener: Option<&LocalListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn next_relay_event(relay: &mut Option<RelayChannel>) -> RelayEvent {
    match relay {
        Some(relay) => relay.next_event().await,
        None => std::future::pending().await,
    }
}

/// Chat client state machine
pub struct Client {
    config: ClientConfig,
    role: Role,
    state: ClientState,
    state_tx: watch::Sender<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    local_port: u16,
    step: Option<RendezvousStep>,
    rendezvous: Option<RendezvousSession>,
    listener: Option<LocalListener>,
    pool: CandidatePool,
    relay: Option<RelayChannel>,
}

impl Client {
    pub fn new(config: ClientConfig) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);

        let role = config.role();
        let pool = CandidatePool::new(Handshake::for_role(role), config.max_line_length);

        let client = Self {
            config,
            role,
            state: ClientState::Connecting,
            state_tx,
            events: event_tx,
            commands: command_rx,
            local_port: 0,
            step: None,
            rendezvous: None,
            listener: None,
            pool,
            relay: None,
        };
        let handle = ClientHandle {
            commands: command_tx,
            state: state_rx,
        };

        (client, handle, event_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Run until shutdown, peer hang-up or a fatal error; everything is closed on return
    pub async fn run(mut self) -> Result<(), ClientError> {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!(error = %e, state = %self.state, "session failed");
        }
        self.teardown().await;
        result
    }

    async fn drive(&mut self) -> Result<(), ClientError> {
        // Step 1: Connect to the directory server from a shareable port
        let Some(stream) = self.connect_server().await? else {
            return Ok(());
        };
        self.local_port = stream.local_addr()?.port();

        // Step 2: Listen for peers on the same port
        let private_ip = select_private_ip(&self.config.local_addrs);
        let private = Endpoint::private(SocketAddr::new(private_ip, self.local_port));
        let listener = LocalListener::bind(private).map_err(ClientError::Listener)?;
        self.listener = Some(listener);

        // Step 3: Register
        self.set_state(ClientState::Registering);
        let session = RendezvousSession::new(stream, &self.config.name, self.config.max_line_length);
        self.issue(session, Request::Register(private));

        // Step 4: Event loop
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => self.send_message(text),
                    Some(Command::Shutdown) | None => {
                        info!("shutdown requested");
                        return Ok(());
                    }
                },

                (issued_in, (session, result)) = next_step(&mut self.step) => {
                    self.step = None;
                    self.on_step(issued_in, session, result)?;
                }

                accepted = next_accept(self.listener.as_ref()) => self.on_accept(accepted),

                Some(outcome) = self.pool.next_outcome(), if !self.pool.is_empty() => {
                    self.on_candidate(outcome).await?;
                }

                event = next_relay_event(&mut self.relay) => match event {
                    RelayEvent::Message { sender, text } => {
                        self.emit(ClientEvent::Message { sender, text });
                    }
                    RelayEvent::Closed => {
                        info!("peer closed the connection");
                        return Ok(());
                    }
                    RelayEvent::Failed(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Connect to the directory server; `None` if shutdown came first
    async fn connect_server(&mut self) -> Result<Option<TcpStream>, ClientError> {
        let server = self.config.server_addr;
        info!(%server, "connecting to directory server");

        let connect = connect_reusable(0, server, self.config.dial_timeout);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => debug!("not connected, dropping message"),
                    Some(Command::Shutdown) | None => return Ok(None),
                },

                stream = &mut connect => {
                    let stream = stream.map_err(SignallingError::from)?;
                    return Ok(Some(stream));
                }
            }
        }
    }

    fn issue(&mut self, session: RendezvousSession, request: Request) {
        debug!(?request, state = %self.state, "directory request");
        self.step = Some(RendezvousStep {
            issued_in: self.state,
            future: Box::pin(run_step(session, request)),
        });
    }

    fn on_step(
        &mut self,
        issued_in: ClientState,
        session: RendezvousSession,
        result: Result<Reply, SignallingError>,
    ) -> Result<(), ClientError> {
        if issued_in != self.state {
            debug!(%issued_in, state = %self.state, "dropping stale directory reply");
            return Ok(());
        }
        let reply = result?;

        let Some(friend) = self.config.friend_name.clone() else {
            // Passive: nothing to ask after registering
            info!(name = %self.config.name, "registered, waiting for a peer");
            self.rendezvous = Some(session);
            self.set_state(ClientState::Idle);
            return Ok(());
        };

        match reply {
            Reply::Registered => {
                info!(name = %self.config.name, %friend, "registered, looking for friend");
                self.set_state(ClientState::WaitingForFriend);
                self.issue(session, Request::Roster { target: friend, delay: Duration::ZERO });
            }

            Reply::Roster(true) => {
                self.set_state(ClientState::LookingUpFriend);
                self.issue(session, Request::Info(friend));
            }

            Reply::Roster(false) => {
                debug!(%friend, "friend not online yet");
                let delay = self.config.poll_interval;
                self.issue(session, Request::Roster { target: friend, delay });
            }

            Reply::Info(Some(peer)) => {
                info!(%friend, private = %peer.private.addr(), public = %peer.public.addr(), "friend found");
                self.rendezvous = Some(session);
                self.emit(ClientEvent::PeerDiscovered(peer.clone()));
                self.start_race(&peer);
            }

            Reply::Info(None) => {
                // Went offline between the two requests; start over
                self.set_state(ClientState::WaitingForFriend);
                self.issue(session, Request::Roster { target: friend, delay: Duration::ZERO });
            }
        }

        Ok(())
    }

    /// Dial both of the friend's endpoints while the listener keeps accepting
    fn start_race(&mut self, peer: &PeerInfo) {
        self.set_state(ClientState::Racing);

        let mut targets = vec![peer.private];
        if peer.public.addr() != peer.private.addr() {
            targets.push(peer.public);
        }

        for endpoint in targets {
            let id = self.pool.spawn_dial(endpoint, self.local_port, self.config.dial_timeout);
            debug!(id, %endpoint, "candidate dial started");
        }
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, from)) if self.state.accepts_candidates(self.role) => {
                let id = self.pool.spawn_accepted(stream);
                debug!(id, %from, "inbound candidate");
            }
            Ok((_, from)) => {
                debug!(%from, state = %self.state, "refusing inbound connection");
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    async fn on_candidate(&mut self, outcome: CandidateOutcome) -> Result<(), ClientError> {
        let CandidateOutcome { id, provenance, result } = outcome;

        match result {
            Ok(candidate) => self.start_commutation(candidate).await,
            Err(e @ ActivationError::Unexpected(_))
                if self.role == Role::Passive && self.config.strict_activation =>
            {
                Err(e.into())
            }
            Err(e) => {
                warn!(id, %provenance, error = %e, "candidate discarded");
                // The passive peer never dials, so nothing else can arrive
                if self.role == Role::Active && self.state == ClientState::Racing && self.pool.is_empty() {
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    /// Promote the winning candidate to the chat channel
    async fn start_commutation(&mut self, candidate: Candidate) -> Result<(), ClientError> {
        if matches!(self.state, ClientState::Communicating | ClientState::Closed) {
            candidate.close();
            return Ok(());
        }

        // Step 1: Close every other candidate
        let losers = self.pool.close_all().await;

        // Step 2: Stop listening and leave the directory server
        self.listener = None;
        self.step = None;
        if let Some(session) = self.rendezvous.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "directory session close failed");
            }
        }

        // Step 3: Take over the winner
        info!(
            peer = %candidate.peer_addr(),
            provenance = %candidate.provenance(),
            losers,
            "chat channel established"
        );
        let mut relay = RelayChannel::new(candidate, self.config.queue_capacity);
        if self.role == Role::Passive {
            relay.send_control(PeerMessage::ConfirmActivation);
        }
        self.relay = Some(relay);
        self.set_state(ClientState::Communicating);

        Ok(())
    }

    fn send_message(&mut self, text: String) {
        let Some(relay) = self.relay.as_mut() else {
            warn!(state = %self.state, "not communicating, message rejected");
            return;
        };

        let text = sanitize_text(&text);
        if text.trim().is_empty() {
            debug!("ignoring empty message");
            return;
        }

        let message = PeerMessage::Chat {
            sender: self.config.name.clone(),
            text,
        };
        if message.to_string().len() > self.config.max_line_length {
            warn!(max = self.config.max_line_length, "message too long, not sent");
            return;
        }

        if let Some(PeerMessage::Chat { text: lost, .. }) = relay.enqueue(message) {
            warn!(capacity = relay.queue().capacity(), "output queue full, dropped oldest message");
            self.emit(ClientEvent::MessageLost(lost));
        }
    }

    /// Close every socket and report `Closed`
    async fn teardown(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }

        self.pool.close_all().await;
        self.relay = None;
        self.listener = None;
        self.step = None;
        if let Some(session) = self.rendezvous.take() {
            let _ = session.close().await;
        }

        self.set_state(ClientState::Closed);
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "state change");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(ClientEvent::StateChanged(state));
    }

    fn emit(&self, event: ClientEvent) {
        // The display may already be gone
        let _ = self.events.send(event);
    }
}
