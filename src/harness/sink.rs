//! Discarding server.
//!
//! Every client is read until EOF or error; bytes are counted and thrown
//! away. When a client goes away its totals are logged.

use crate::config::SinkConfig;
use crate::net;
use crate::runtime::{InterestSet, MioReactor, Reactor, Readiness, LISTENER_TOKEN};
use crate::stats::Throughput;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct SinkClient {
    stream: TcpStream,
    addr: SocketAddr,
    started: Instant,
    bytes: u64,
}

/// Totals for one client that has gone away.
#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub addr: SocketAddr,
    pub throughput: Throughput,
    /// Set when the connection ended with an error instead of EOF.
    pub error: Option<String>,
}

pub struct SinkServer {
    reactor: MioReactor,
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: Slab<SinkClient>,
    ready: Vec<Readiness>,
    scratch: Vec<u8>,
    config: SinkConfig,
}

impl SinkServer {
    pub fn bind(config: &SinkConfig) -> io::Result<Self> {
        let mut reactor = MioReactor::new(config.events_capacity)?;
        let mut listener = net::bind_listener(config.listen, &config.socket)?;
        let local_addr = listener.local_addr()?;
        reactor.register(&mut listener, LISTENER_TOKEN, InterestSet::READABLE)?;

        Ok(Self {
            reactor,
            listener,
            local_addr,
            clients: Slab::new(),
            ready: Vec::with_capacity(config.events_capacity),
            scratch: vec![0u8; config.buffer_size],
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn run(&mut self) -> io::Result<()> {
        info!(listen = %self.local_addr(), "Waiting for client connections");
        loop {
            for summary in self.turn()? {
                log_summary(&summary);
            }
        }
    }

    /// Wait once and service whatever became ready.
    pub fn turn(&mut self) -> io::Result<Vec<ClientSummary>> {
        self.ready.clear();
        self.reactor.wait(&mut self.ready, Some(self.config.poll_timeout))?;

        let mut finished = Vec::new();
        for i in 0..self.ready.len() {
            let token = self.ready[i].token;
            if token == LISTENER_TOKEN {
                self.accept_clients();
                continue;
            }
            if let Some(summary) = self.drain_client(token.0) {
                finished.push(summary);
            }
        }
        Ok(finished)
    }

    fn accept_clients(&mut self) {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            };

            if let Err(e) = net::tune_stream(&stream, &self.config.socket) {
                debug!(client = %addr, error = %e, "Failed to tune client socket");
            }

            let entry = self.clients.vacant_entry();
            let token = Token(entry.key());
            if let Err(e) = self.reactor.register(&mut stream, token, InterestSet::READABLE) {
                warn!(client = %addr, error = %e, "Failed to register client");
                continue;
            }

            info!(client = %addr, "New connection");
            entry.insert(SinkClient {
                stream,
                addr,
                started: Instant::now(),
                bytes: 0,
            });
        }
    }

    /// Read until the socket would block. Returns a summary if the client
    /// is finished.
    fn drain_client(&mut self, key: usize) -> Option<ClientSummary> {
        let client = self.clients.get_mut(key)?;

        let error = loop {
            match client.stream.read(&mut self.scratch) {
                Ok(0) => break None,
                Ok(n) => client.bytes += n as u64,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(e.to_string()),
            }
        };

        let mut client = self.clients.remove(key);
        let _ = self.reactor.deregister(&mut client.stream);

        Some(ClientSummary {
            addr: client.addr,
            throughput: Throughput::new(client.bytes, client.started.elapsed()),
            error,
        })
    }
}

fn log_summary(summary: &ClientSummary) {
    match &summary.error {
        None => info!(client = %summary.addr, "Connection closed by client. {}", summary.throughput),
        Some(e) => warn!(client = %summary.addr, error = %e, "Error receiving data. {}", summary.throughput),
    }
}

/// Run the sink until the process is stopped.
pub fn run(config: &SinkConfig) -> io::Result<()> {
    SinkServer::bind(config)?.run()
}
