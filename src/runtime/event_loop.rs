//! Reactor loop driving every relay on one thread.
//!
//! Readiness-based model: the reactor tells us which sockets are ready,
//! then each relay performs non-blocking reads and writes. Relays live in
//! a slab keyed by relay id; tokens encode (id, side).
//!
//! Relays that close while a batch of events is being dispatched stay in
//! the slab, marked closed, until the batch is done. That way a later
//! event in the same batch cannot land on a new relay that reused the slot.

use crate::config::{ProxyConfig, SocketConfig};
use crate::net;
use crate::runtime::error::RelayError;
use crate::runtime::reactor::{InterestSet, MioReactor, Reactor, Readiness};
use crate::runtime::relay::{CloseReason, Relay, RelayReport, RelayState};
use crate::runtime::token::{self, LISTENER_TOKEN};
use mio::net::TcpListener;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Single-threaded relay server.
pub struct ProxyServer {
    reactor: MioReactor,
    listener: TcpListener,
    local_addr: SocketAddr,
    upstream: SocketAddr,
    relays: Slab<Relay>,
    /// Relays closed during the current turn, removed once it ends.
    closed: Vec<usize>,
    /// Clients dropped before a relay existed for them.
    rejected: Vec<RelayReport>,
    ready: Vec<Readiness>,
    buffer_size: usize,
    max_relays: usize,
    idle_timeout: Option<Duration>,
    poll_timeout: Duration,
    socket: SocketConfig,
}

impl ProxyServer {
    /// Bind the listener and set up the reactor.
    pub fn bind(config: &ProxyConfig) -> io::Result<Self> {
        let mut reactor = MioReactor::new(config.events_capacity)?;
        let mut listener = net::bind_listener(config.listen, &config.socket)?;
        let local_addr = listener.local_addr()?;
        reactor.register(&mut listener, LISTENER_TOKEN, InterestSet::READABLE)?;

        Ok(Self {
            reactor,
            listener,
            local_addr,
            upstream: config.upstream,
            relays: Slab::with_capacity(config.max_relays.min(1024)),
            closed: Vec::new(),
            rejected: Vec::new(),
            ready: Vec::with_capacity(config.events_capacity),
            buffer_size: config.buffer_size,
            max_relays: config.max_relays,
            idle_timeout: config.idle_timeout,
            poll_timeout: config.poll_timeout,
            socket: config.socket.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relays currently open, not counting those closed this turn.
    pub fn active_relays(&self) -> usize {
        self.relays.len().saturating_sub(self.closed.len())
    }

    /// Serve forever, logging each relay's report as it finishes.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            listen = %self.local_addr(),
            upstream = %self.upstream,
            buffer_size = self.buffer_size,
            max_relays = self.max_relays,
            "Relay server started"
        );

        loop {
            let reports = self.turn()?;
            for report in &reports {
                log_report(report);
            }
            if !reports.is_empty() {
                debug!(active = self.active_relays(), "Relays remaining");
            }
        }
    }

    /// One reactor cycle: wait, dispatch, resume, evict, reap.
    ///
    /// Returns reports for the relays that finished during the cycle.
    pub fn turn(&mut self) -> io::Result<Vec<RelayReport>> {
        // Leftover work means there is something to do without waiting
        let timeout = if self.relays.iter().any(|(_, r)| r.has_pending_work()) {
            Duration::ZERO
        } else {
            self.poll_timeout
        };

        self.ready.clear();
        self.reactor.wait(&mut self.ready, Some(timeout))?;

        for readiness in &self.ready {
            match token::decode(readiness.token) {
                None => {
                    // Relays closed earlier in this batch no longer count
                    // against the limit
                    let live = self.relays.len().saturating_sub(self.closed.len());
                    accept_clients(
                        &self.listener,
                        &mut self.reactor,
                        &mut self.relays,
                        live,
                        &mut self.rejected,
                        self.upstream,
                        self.buffer_size,
                        self.max_relays,
                        &self.socket,
                    )
                }
                Some((id, side)) => {
                    let Some(relay) = self.relays.get_mut(id) else {
                        continue;
                    };
                    if relay.is_closed() {
                        continue;
                    }
                    if relay.handle_event(&mut self.reactor, side, readiness) == RelayState::Closed {
                        self.closed.push(id);
                    }
                }
            }
        }

        for (id, relay) in self.relays.iter_mut() {
            if relay.has_pending_work() && relay.resume(&mut self.reactor) == RelayState::Closed {
                self.closed.push(id);
            }
        }

        if let Some(limit) = self.idle_timeout {
            evict_idle(&mut self.reactor, &mut self.relays, &mut self.closed, limit, Instant::now());
        }

        Ok(self.reap())
    }

    /// Remove relays closed during this turn and collect their reports.
    fn reap(&mut self) -> Vec<RelayReport> {
        let mut reports: Vec<RelayReport> = self.rejected.drain(..).collect();
        for id in self.closed.drain(..) {
            if let Some(relay) = self.relays.try_remove(id) {
                if let Some(report) = relay.report() {
                    reports.push(report);
                }
            }
        }
        reports
    }
}

fn accept_clients(
    listener: &TcpListener,
    reactor: &mut MioReactor,
    relays: &mut Slab<Relay>,
    mut live: usize,
    rejected: &mut Vec<RelayReport>,
    upstream: SocketAddr,
    buffer_size: usize,
    max_relays: usize,
    socket: &SocketConfig,
) {
    loop {
        let (stream, client_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        };

        if live >= max_relays {
            warn!(client = %client_addr, max_relays, "Relay limit reached, rejecting client");
            continue;
        }

        if let Err(e) = net::tune_stream(&stream, socket) {
            debug!(client = %client_addr, error = %e, "Failed to tune client socket");
        }

        let entry = relays.vacant_entry();
        let id = entry.key();

        let peer = match net::connect(upstream, socket) {
            Ok(peer) => peer,
            Err(source) => {
                let err = RelayError::Connect {
                    addr: upstream,
                    source,
                };
                debug!(client = %client_addr, error = %err, "Dropping client");
                rejected.push(RelayReport::connect_failed(id, client_addr, upstream, &err));
                continue;
            }
        };

        match Relay::new(id, stream, client_addr, peer, upstream, buffer_size, reactor) {
            Ok(relay) => {
                debug!(relay = id, client = %client_addr, "Accepted client");
                entry.insert(relay);
                live += 1;
            }
            Err(e) => {
                warn!(client = %client_addr, error = %e, "Failed to set up relay");
            }
        }
    }
}

fn evict_idle(
    reactor: &mut MioReactor,
    relays: &mut Slab<Relay>,
    closed: &mut Vec<usize>,
    limit: Duration,
    now: Instant,
) {
    for (id, relay) in relays.iter_mut() {
        if relay.is_closed() || relay.idle_for(now) < limit {
            continue;
        }
        debug!(
            relay = relay.id(),
            state = ?relay.state(),
            client = %relay.client_addr(),
            upstream_bytes = relay.upstream_bytes(),
            downstream_bytes = relay.downstream_bytes(),
            "Evicting idle relay"
        );
        relay.close(reactor, CloseReason::IdleTimeout);
        closed.push(id);
    }
}

/// Log a finished relay with per-direction totals and rates.
fn log_report(report: &RelayReport) {
    let elapsed = report.upstream.elapsed.as_secs_f64();
    if report.reason.is_clean() {
        info!(
            relay = report.id,
            client = %report.client_addr,
            peer = %report.peer_addr,
            upstream_bytes = report.upstream.bytes,
            upstream_gb = report.upstream.gigabytes(),
            upstream_gbps = report.upstream.gbps(),
            downstream_bytes = report.downstream.bytes,
            downstream_gb = report.downstream.gigabytes(),
            downstream_gbps = report.downstream.gbps(),
            duration_s = elapsed,
            started = %report.started_at.to_rfc3339(),
            finished = %report.finished_at.to_rfc3339(),
            "Relay finished"
        );
    } else {
        warn!(
            relay = report.id,
            client = %report.client_addr,
            peer = %report.peer_addr,
            upstream_bytes = report.upstream.bytes,
            downstream_bytes = report.downstream.bytes,
            duration_s = elapsed,
            reason = %report.reason,
            finished = %report.finished_at.to_rfc3339(),
            "Relay aborted"
        );
    }
}
