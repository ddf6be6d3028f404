#![allow(dead_code)]

/*
 * tests/common/mod.rs
 *
 * In-process directory server and client helpers for the scenario tests
 */

use futures_util::{SinkExt, StreamExt};
use rendezvous_chat::{Client, ClientConfig, ClientError, ClientEvent, ClientHandle, ClientState};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Framed, LinesCodec};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// A line received by the directory server
#[derive(Debug, Clone)]
pub struct LoggedRequest {
    pub at: Instant,
    pub from: SocketAddr,
    pub line: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub private: SocketAddr,
    pub public: SocketAddr,
}

#[derive(Default)]
struct Directory {
    registry: HashMap<String, Registration>,
    log: Vec<LoggedRequest>,
    hidden_lists: usize,
}

pub struct MockDirectory {
    addr: SocketAddr,
    directory: Arc<Mutex<Directory>>,
    task: JoinHandle<()>,
}

impl MockDirectory {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let directory = Arc::new(Mutex::new(Directory::default()));

        let shared = directory.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, from)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve(stream, from, shared.clone()));
            }
        });

        Self {
            addr,
            directory,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answer the next `count` roster requests as if nobody else were online
    pub fn hide_from_lists(&self, count: usize) {
        self.directory.lock().unwrap().hidden_lists = count;
    }

    /// List `name` without a client behind it, so `get_info` hands out these endpoints
    pub fn enroll(&self, name: &str, private: SocketAddr, public: SocketAddr) {
        self.directory
            .lock()
            .unwrap()
            .registry
            .insert(name.to_string(), Registration { private, public });
    }

    pub fn registration(&self, name: &str) -> Option<Registration> {
        self.directory.lock().unwrap().registry.get(name).copied()
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.directory.lock().unwrap().log.clone()
    }

    /// Requests whose line starts with `title`
    pub fn requests_titled(&self, title: &str) -> Vec<LoggedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.line.split(' ').next() == Some(title))
            .collect()
    }
}

impl Drop for MockDirectory {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, from: SocketAddr, directory: Arc<Mutex<Directory>>) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    let mut own_name: Option<String> = None;

    while let Some(Ok(line)) = framed.next().await {
        let line = line.trim_end_matches('\r').to_string();
        let reply = {
            let mut directory = directory.lock().unwrap();
            directory.log.push(LoggedRequest {
                at: Instant::now(),
                from,
                line: line.clone(),
            });
            respond(&mut directory, &line, from, &mut own_name)
        };

        if framed.send(format!("{reply}\r")).await.is_err() {
            break;
        }
    }

    if let Some(name) = own_name {
        directory.lock().unwrap().registry.remove(&name);
    }
}

fn respond(
    directory: &mut Directory,
    line: &str,
    from: SocketAddr,
    own_name: &mut Option<String>,
) -> String {
    let tokens: Vec<&str> = line.split(' ').collect();

    match tokens.as_slice() {
        ["connect", name, _, _] if directory.registry.contains_key(*name) => {
            "name_taken".to_string()
        }

        ["connect", name, ip, port] => {
            let (Ok(ip), Ok(port)) = (ip.parse::<IpAddr>(), port.parse::<u16>()) else {
                return "bad_request".to_string();
            };
            // A wildcard private address is reachable on loopback
            let ip = if ip.is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                ip
            };
            directory.registry.insert(
                name.to_string(),
                Registration {
                    private: SocketAddr::new(ip, port),
                    public: from,
                },
            );
            *own_name = Some(name.to_string());
            "confirm_connection".to_string()
        }

        ["get_list"] => {
            if directory.hidden_lists > 0 {
                directory.hidden_lists -= 1;
                return match own_name {
                    Some(name) => format!("list {name}"),
                    None => "list".to_string(),
                };
            }
            let mut names: Vec<&String> = directory.registry.keys().collect();
            names.sort();
            let mut reply = "list".to_string();
            for name in names {
                reply.push(' ');
                reply.push_str(name);
            }
            reply
        }

        ["get_info", name] => match directory.registry.get(*name) {
            Some(entry) => format!(
                "info {} {} {} {}",
                entry.private.ip(),
                entry.private.port(),
                entry.public.ip(),
                entry.public.port()
            ),
            None => "unknown_user".to_string(),
        },

        _ => "unknown_command".to_string(),
    }
}

/// A client running in its own task
pub struct RunningClient {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub task: JoinHandle<Result<(), ClientError>>,
}

impl RunningClient {
    pub fn spawn(config: ClientConfig) -> Self {
        let (client, handle, events) = Client::new(config);
        Self {
            handle,
            events,
            task: tokio::spawn(client.run()),
        }
    }

    pub async fn reach(&self, state: ClientState) {
        let reached = timeout(STEP_TIMEOUT, self.handle.wait_for_state(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}, stuck in {}", self.handle.state()));
        assert_eq!(reached, Some(state));
    }

    /// Next chat message, skipping other events
    pub async fn next_message(&mut self) -> (String, String) {
        loop {
            let event = timeout(STEP_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("event channel closed");
            if let ClientEvent::Message { sender, text } = event {
                return (sender, text);
            }
        }
    }

    pub async fn finish(self) -> Result<(), ClientError> {
        timeout(STEP_TIMEOUT, self.task)
            .await
            .expect("client did not stop")
            .expect("client task panicked")
    }
}

/// A loopback address with nothing listening on it
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn passive_config(name: &str, server: SocketAddr) -> ClientConfig {
    ClientConfig::new(name, server)
}

pub fn active_config(name: &str, server: SocketAddr, friend: &str) -> ClientConfig {
    ClientConfig::new(name, server).with_friend(friend)
}
