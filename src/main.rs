use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use crossterm::{
    cursor::MoveToColumn,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    queue,
    style::{Print, PrintStyledContent, Stylize},
    terminal::{self, Clear, ClearType},
};
use rendezvous_chat::{Client, ClientConfig, ClientEvent, ClientHandle, ClientState};
use std::{
    io::{self, IsTerminal, Write},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const PROMPT: &str = "You: ";

/// Peer-to-peer chat through a directory server
#[derive(Debug, Parser)]
#[command(name = "rvchat", version, about)]
struct Args {
    /// Name to register with the directory server
    #[arg(value_parser = parse_name)]
    name: String,

    /// Directory server IP address
    server_ip: IpAddr,

    /// Directory server port
    server_port: u16,

    /// Friend to connect to; without it, wait to be contacted
    #[arg(value_parser = parse_name)]
    friend_name: Option<String>,

    /// Delay between roster polls while the friend is offline
    #[arg(long, env = "RVCHAT_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Connect timeout for the server and each peer dial
    #[arg(long, env = "RVCHAT_DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    dial_timeout_ms: u64,

    /// Outgoing messages kept while a write is in progress
    #[arg(long, env = "RVCHAT_QUEUE_CAPACITY", default_value_t = ClientConfig::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Give up when an inbound connection opens with anything but `activate`
    #[arg(long, env = "RVCHAT_STRICT_ACTIVATION")]
    strict_activation: bool,
}

impl Args {
    fn into_config(self, local_addrs: Vec<IpAddr>) -> ClientConfig {
        let mut config = ClientConfig::new(self.name, SocketAddr::new(self.server_ip, self.server_port));
        config.friend_name = self.friend_name;
        config.local_addrs = local_addrs;
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config.dial_timeout = Duration::from_millis(self.dial_timeout_ms);
        config.queue_capacity = self.queue_capacity;
        config.strict_activation = self.strict_activation;
        config
    }
}

/// Names travel as single protocol tokens
fn parse_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return Err("name must not contain whitespace".to_string());
    }
    Ok(name.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.friend_name.as_deref() == Some(args.name.as_str()) {
        Args::command()
            .error(
                clap::error::ErrorKind::ArgumentConflict,
                "cannot connect to yourself: friend name equals own name",
            )
            .exit();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let config = args.into_config(local_addresses());

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(Duration::from_millis(100));

    result
}

/// Candidate addresses for the private endpoint, preferred one first
fn local_addresses() -> Vec<IpAddr> {
    let mut addrs = Vec::new();

    if let Ok(ip) = local_ip_address::local_ip() {
        addrs.push(ip);
    }
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => addrs.extend(interfaces.into_iter().map(|(_, ip)| ip)),
        Err(e) => warn!(error = %e, "could not list network interfaces"),
    }

    addrs
}

async fn run(config: ClientConfig) -> Result<()> {
    let console = Console::new(io::stdin().is_terminal());
    let name = config.name.clone();
    let friend = config.friend_name.clone();

    let (client, handle, events) = Client::new(config);
    let client = tokio::spawn(client.run());
    let display = tokio::spawn(display(events, console.clone(), name, friend));

    // Step 1: Feed user input to the client
    let keys = if console.interactive {
        let handle = handle.clone();
        let console = console.clone();
        Some(tokio::task::spawn_blocking(move || read_keys(&handle, &console)))
    } else {
        tokio::spawn(read_lines(handle.clone(), console.clone()));
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.shutdown();
            }
        });
        None
    };

    // Step 2: Wait for the session to end
    let result = client.await.context("Client task failed")?;

    // Step 3: Restore the terminal and flush pending output
    if let Some(keys) = keys {
        keys.await.context("Input task failed")?.context("Terminal error")?;
    }
    display.await.context("Display task failed")?;

    result.context("Chat session ended with an error")
}

/// Shared terminal state: the line being typed is redrawn under every output line
#[derive(Clone)]
struct Console {
    input: Arc<Mutex<String>>,
    interactive: bool,
}

impl Console {
    fn new(interactive: bool) -> Self {
        Self {
            input: Arc::new(Mutex::new(String::new())),
            interactive,
        }
    }

    fn edit<R>(&self, f: impl FnOnce(&mut String) -> R) -> R {
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut input)
    }

    /// Print a line above the prompt
    fn print(&self, sender: Option<&str>, text: &str) -> io::Result<()> {
        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = io::stdout().lock();

        if self.interactive {
            queue!(out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        }
        if let Some(sender) = sender {
            queue!(out, PrintStyledContent(sender.bold()), Print(": "))?;
        }
        queue!(out, Print(text))?;

        if self.interactive {
            queue!(out, Print("\r\n"), Print(PROMPT), Print(&*input))?;
        } else {
            queue!(out, Print("\n"))?;
        }
        out.flush()
    }

    fn redraw(&self) -> io::Result<()> {
        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = io::stdout().lock();
        queue!(
            out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(PROMPT),
            Print(&*input)
        )?;
        out.flush()
    }
}

async fn display(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    console: Console,
    name: String,
    friend: Option<String>,
) {
    while let Some(event) = events.recv().await {
        let line = match event {
            ClientEvent::Message { sender, text } => {
                if let Err(e) = console.print(Some(&sender), &text) {
                    warn!(error = %e, "display failed");
                }
                continue;
            }
            ClientEvent::StateChanged(ClientState::Idle) => {
                format!("Registered as {name}, waiting for a friend to connect...")
            }
            ClientEvent::StateChanged(ClientState::WaitingForFriend) => match &friend {
                Some(friend) => format!("Waiting for {friend} to come online..."),
                None => continue,
            },
            ClientEvent::StateChanged(ClientState::Racing) => "Connecting...".to_string(),
            ClientEvent::StateChanged(ClientState::Communicating) => {
                "Connected! Type a message and press Enter. Ctrl+C exits.".to_string()
            }
            ClientEvent::StateChanged(ClientState::Closed) => "Connection closed.".to_string(),
            ClientEvent::StateChanged(_) => continue,
            ClientEvent::PeerDiscovered(peer) => format!(
                "Found {} (private {}, public {})",
                peer.name,
                peer.private.addr(),
                peer.public.addr()
            ),
            ClientEvent::MessageLost(text) => format!("Not delivered, queue full: {text}"),
        };

        if let Err(e) = console.print(None, &line) {
            warn!(error = %e, "display failed");
        }
    }
}

/// Raw-mode line editor; returns once the client is closed
fn read_keys(handle: &ClientHandle, console: &Console) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let result = key_loop(handle, console);
    terminal::disable_raw_mode()?;
    print!("\r\n");
    io::stdout().flush()?;
    result
}

fn key_loop(handle: &ClientHandle, console: &Console) -> io::Result<()> {
    console.redraw()?;

    while handle.state() != ClientState::Closed {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match (key.code, key.modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => {
                handle.shutdown();
                break;
            }
            (KeyCode::Enter, _) => {
                let line = console.edit(std::mem::take);
                if line.trim().is_empty() {
                    console.redraw()?;
                    continue;
                }
                match handle.send_message(line.clone()) {
                    Ok(()) => console.print(Some("You"), &line)?,
                    Err(e) => console.print(None, &format!("Not sent: {e}"))?,
                }
            }
            (KeyCode::Backspace, _) => {
                console.edit(|input| input.pop());
                console.redraw()?;
            }
            (KeyCode::Char(c), _) => {
                console.edit(|input| input.push(c));
                console.redraw()?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Piped input: one message per line
async fn read_lines(handle: ClientHandle, console: Console) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                if let Err(e) = handle.send_message(line) {
                    let _ = console.print(None, &format!("Not sent: {e}"));
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}
