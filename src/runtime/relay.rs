//! Relay state machine.
//!
//! A relay pairs one accepted client socket with one upstream peer socket
//! and moves bytes both ways through two flow-controlled channels:
//!
//! ```text
//! CONNECTING -> RELAYING -> CLIENT_HALF_CLOSED | PEER_HALF_CLOSED -> CLOSED
//! ```
//!
//! Any fatal error closes the relay from whatever state it is in. Closing
//! deregisters both sockets before shutting them down, so the reactor
//! never reports an event for a closed relay.

use crate::runtime::channel::FlowControlledChannel;
use crate::runtime::error::{Direction, RelayError};
use crate::runtime::reactor::{InterestSet, Reactor, Readiness};
use crate::runtime::token::{self, Side};
use crate::stats::Throughput;
use chrono::{DateTime, Utc};
use mio::net::TcpStream;
use mio::Token;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Channel rounds per dispatch before yielding to other relays.
const PUMP_ROUNDS: usize = 16;

/// Lifecycle of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Upstream connect in flight.
    Connecting,
    /// Both directions active.
    Relaying,
    /// Client finished sending; peer write side has been shut down.
    ClientHalfClosed,
    /// Peer finished sending; client write side has been shut down.
    PeerHalfClosed,
    /// Terminal.
    Closed,
}

/// Why a relay closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Both sides reached EOF and every byte was delivered.
    Clean,
    /// The upstream connect failed.
    ConnectFailed { error: String },
    /// An endpoint reset or aborted its connection.
    RemoteError {
        direction: Option<Direction>,
        error: String,
    },
    /// Any other failure while servicing the relay.
    LocalError {
        direction: Option<Direction>,
        error: String,
    },
    /// No bytes moved for longer than the idle timeout.
    IdleTimeout,
}

impl CloseReason {
    fn from_error(err: &RelayError) -> Self {
        match err {
            RelayError::Connect { .. } => CloseReason::ConnectFailed {
                error: err.to_string(),
            },
            _ if err.is_remote() => CloseReason::RemoteError {
                direction: err.direction(),
                error: err.to_string(),
            },
            _ => CloseReason::LocalError {
                direction: err.direction(),
                error: err.to_string(),
            },
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Clean)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Clean => f.write_str("clean close"),
            CloseReason::ConnectFailed { error } => write!(f, "connect failed: {error}"),
            CloseReason::RemoteError {
                direction: Some(d),
                error,
            } => write!(f, "remote error on {d}: {error}"),
            CloseReason::RemoteError { error, .. } => write!(f, "remote error: {error}"),
            CloseReason::LocalError {
                direction: Some(d),
                error,
            } => write!(f, "local error on {d}: {error}"),
            CloseReason::LocalError { error, .. } => write!(f, "local error: {error}"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

/// Final accounting for a closed relay.
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub id: usize,
    pub client_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    /// Client to peer.
    pub upstream: Throughput,
    /// Peer to client.
    pub downstream: Throughput,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reason: CloseReason,
}

impl RelayReport {
    /// Report for a client whose upstream connect failed before a relay
    /// could be built around it.
    pub fn connect_failed(
        id: usize,
        client_addr: SocketAddr,
        peer_addr: SocketAddr,
        err: &RelayError,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_addr,
            peer_addr,
            upstream: Throughput::new(0, Duration::ZERO),
            downstream: Throughput::new(0, Duration::ZERO),
            started_at: now,
            finished_at: now,
            reason: CloseReason::from_error(err),
        }
    }
}

/// One socket of a relay and the interest currently registered for it.
#[derive(Debug)]
struct Endpoint {
    stream: TcpStream,
    addr: SocketAddr,
    token: Token,
    /// Empty while not registered.
    interest: InterestSet,
}

impl Endpoint {
    fn new(stream: TcpStream, addr: SocketAddr, token: Token) -> Self {
        Self {
            stream,
            addr,
            token,
            interest: InterestSet::NONE,
        }
    }

    /// Bring the registration in line with `desired`.
    ///
    /// mio cannot hold an empty interest set, so an empty set deregisters.
    fn sync<R: Reactor>(&mut self, reactor: &mut R, desired: InterestSet) -> io::Result<()> {
        if desired == self.interest {
            return Ok(());
        }
        if desired.is_empty() {
            reactor.deregister(&mut self.stream)?;
        } else if self.interest.is_empty() {
            reactor.register(&mut self.stream, self.token, desired)?;
        } else {
            reactor.modify(&mut self.stream, self.token, desired)?;
        }
        self.interest = desired;
        Ok(())
    }
}

/// Bidirectional relay between a client and its upstream peer.
#[derive(Debug)]
pub struct Relay {
    id: usize,
    state: RelayState,
    client: Endpoint,
    peer: Endpoint,
    /// Client to peer.
    upstream: FlowControlledChannel,
    /// Peer to client.
    downstream: FlowControlledChannel,
    started_at: DateTime<Utc>,
    started: Instant,
    last_activity: Instant,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    reason: Option<CloseReason>,
}

impl Relay {
    /// Pair `client` with `peer`, whose non-blocking connect to
    /// `peer_addr` is in flight.
    ///
    /// The peer socket is registered for writability so connect completion
    /// is reported; the client is left unregistered until then.
    pub fn new<R: Reactor>(
        id: usize,
        client: TcpStream,
        client_addr: SocketAddr,
        peer: TcpStream,
        peer_addr: SocketAddr,
        buffer_size: usize,
        reactor: &mut R,
    ) -> Result<Self, RelayError> {
        let upstream = FlowControlledChannel::new(Direction::Upstream, buffer_size)?;
        let downstream = FlowControlledChannel::new(Direction::Downstream, buffer_size)?;

        let now = Instant::now();
        let mut relay = Self {
            id,
            state: RelayState::Connecting,
            client: Endpoint::new(client, client_addr, token::encode(id, Side::Client)),
            peer: Endpoint::new(peer, peer_addr, token::encode(id, Side::Peer)),
            upstream,
            downstream,
            started_at: Utc::now(),
            started: now,
            last_activity: now,
            finished_at: None,
            finished: None,
            reason: None,
        };

        relay
            .peer
            .sync(reactor, InterestSet::WRITABLE)
            .map_err(RelayError::Reactor)?;

        Ok(relay)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == RelayState::Closed
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client.addr
    }

    /// Bytes delivered client to peer so far.
    pub fn upstream_bytes(&self) -> u64 {
        self.upstream.bytes_written()
    }

    /// Bytes delivered peer to client so far.
    pub fn downstream_bytes(&self) -> u64 {
        self.downstream.bytes_written()
    }

    /// Time since bytes last moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether cached readiness still allows progress that was cut short
    /// to keep other relays serviced.
    pub fn has_pending_work(&self) -> bool {
        match self.state {
            RelayState::Connecting | RelayState::Closed => false,
            _ => {
                self.upstream.can_read()
                    || self.upstream.can_write()
                    || self.downstream.can_read()
                    || self.downstream.can_write()
            }
        }
    }

    /// Dispatch one readiness event for `side`.
    ///
    /// Events for a closed relay are ignored.
    pub fn handle_event<R: Reactor>(
        &mut self,
        reactor: &mut R,
        side: Side,
        readiness: &Readiness,
    ) -> RelayState {
        let result = match self.state {
            RelayState::Closed => return RelayState::Closed,
            RelayState::Connecting if side == Side::Peer => self.on_connect_event(),
            RelayState::Connecting => Ok(()),
            _ => self.observe(side, readiness),
        };

        let result = result.and_then(|()| self.advance(reactor));
        if let Err(e) = result {
            self.fail(reactor, e);
        }
        self.state
    }

    /// Continue work left over from an earlier dispatch.
    pub fn resume<R: Reactor>(&mut self, reactor: &mut R) -> RelayState {
        if self.state == RelayState::Closed {
            return RelayState::Closed;
        }
        if let Err(e) = self.advance(reactor) {
            self.fail(reactor, e);
        }
        self.state
    }

    /// Tear the relay down: deregister, then shut down both sockets.
    ///
    /// The descriptors are released when the relay is dropped.
    pub fn close<R: Reactor>(&mut self, reactor: &mut R, reason: CloseReason) {
        if self.state == RelayState::Closed {
            return;
        }

        let _ = self.client.sync(reactor, InterestSet::NONE);
        let _ = self.peer.sync(reactor, InterestSet::NONE);
        let _ = self.client.stream.shutdown(Shutdown::Both);
        let _ = self.peer.stream.shutdown(Shutdown::Both);

        debug!(
            relay = self.id,
            client = %self.client.addr,
            peer = %self.peer.addr,
            reason = %reason,
            "Relay closed"
        );

        self.state = RelayState::Closed;
        self.finished_at = Some(Utc::now());
        self.finished = Some(Instant::now());
        self.reason = Some(reason);
    }

    /// Final counters; `None` until the relay is closed.
    pub fn report(&self) -> Option<RelayReport> {
        let reason = self.reason.clone()?;
        let finished_at = self.finished_at?;
        let elapsed = self.finished?.saturating_duration_since(self.started);

        Some(RelayReport {
            id: self.id,
            client_addr: self.client.addr,
            peer_addr: self.peer.addr,
            upstream: Throughput::new(self.upstream.bytes_written(), elapsed),
            downstream: Throughput::new(self.downstream.bytes_written(), elapsed),
            started_at: self.started_at,
            finished_at,
            reason,
        })
    }

    fn fail<R: Reactor>(&mut self, reactor: &mut R, err: RelayError) {
        debug!(relay = self.id, error = %err, "Relay failed");
        self.close(reactor, CloseReason::from_error(&err));
    }

    /// Check whether the in-flight connect finished.
    fn on_connect_event(&mut self) -> Result<(), RelayError> {
        let addr = self.peer.addr;
        let connect_failed = |source| RelayError::Connect { addr, source };

        match self.peer.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return Err(connect_failed(e)),
        }

        match self.peer.stream.peer_addr() {
            Ok(_) => {}
            // Spurious wakeup; still connecting
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(connect_failed(e)),
        }

        debug!(relay = self.id, peer = %addr, "Upstream connected");
        self.state = RelayState::Relaying;

        // Either socket may already hold data; a read that would block is harmless
        self.upstream.mark_source_ready();
        self.downstream.mark_source_ready();
        Ok(())
    }

    /// Fold a readiness event into the channels' cached readiness.
    fn observe(&mut self, side: Side, readiness: &Readiness) -> Result<(), RelayError> {
        let (stream, reading, writing) = match side {
            Side::Client => (&mut self.client.stream, &mut self.upstream, &mut self.downstream),
            Side::Peer => (&mut self.peer.stream, &mut self.downstream, &mut self.upstream),
        };

        if readiness.error {
            if let Ok(Some(e)) = stream.take_error() {
                return Err(RelayError::Read {
                    direction: reading.direction(),
                    side,
                    source: e,
                });
            }
        }

        if readiness.readable || readiness.read_closed {
            reading.mark_source_ready();
        }
        if readiness.writable || readiness.write_closed {
            writing.mark_destination_ready();
        }
        Ok(())
    }

    /// Move bytes, half-close finished directions and re-arm interest.
    fn advance<R: Reactor>(&mut self, reactor: &mut R) -> Result<(), RelayError> {
        if matches!(self.state, RelayState::Connecting | RelayState::Closed) {
            return Ok(());
        }

        if self.pump()? {
            self.last_activity = Instant::now();
        }

        self.half_close_drained()?;
        if self.upstream.is_finished() && self.downstream.is_finished() {
            self.close(reactor, CloseReason::Clean);
            return Ok(());
        }

        self.sync_interest(reactor)
    }

    /// Run both channels until neither moves, or the round limit is hit.
    fn pump(&mut self) -> Result<bool, RelayError> {
        let mut moved = false;

        for _ in 0..PUMP_ROUNDS {
            let up = pump_channel(&mut self.upstream, &mut self.client.stream, &mut self.peer.stream)?;
            let down = pump_channel(&mut self.downstream, &mut self.peer.stream, &mut self.client.stream)?;
            if !up && !down {
                break;
            }
            moved = true;
        }

        trace!(
            relay = self.id,
            upstream_read = self.upstream.bytes_read(),
            upstream_buffered = self.upstream.buffered(),
            upstream_blocked = self.upstream.is_write_blocked(),
            downstream_read = self.downstream.bytes_read(),
            downstream_buffered = self.downstream.buffered(),
            downstream_blocked = self.downstream.is_write_blocked(),
            "Pumped"
        );
        Ok(moved)
    }

    fn half_close_drained(&mut self) -> Result<(), RelayError> {
        if self.upstream.is_drained() && !self.upstream.is_finished() {
            shutdown_write(&self.peer.stream, Direction::Upstream)?;
            self.upstream.mark_finished();
            debug!(relay = self.id, bytes = self.upstream.bytes_written(), "Client finished sending");
        }
        if self.downstream.is_drained() && !self.downstream.is_finished() {
            shutdown_write(&self.client.stream, Direction::Downstream)?;
            self.downstream.mark_finished();
            debug!(relay = self.id, bytes = self.downstream.bytes_written(), "Peer finished sending");
        }

        self.state = match (self.upstream.is_finished(), self.downstream.is_finished()) {
            (true, false) => RelayState::ClientHalfClosed,
            (false, true) => RelayState::PeerHalfClosed,
            _ => self.state,
        };
        Ok(())
    }

    /// Read interest only while there is room, write interest only while
    /// there is data.
    fn sync_interest<R: Reactor>(&mut self, reactor: &mut R) -> Result<(), RelayError> {
        let client = InterestSet {
            readable: self.upstream.wants_read(),
            writable: self.downstream.wants_write(),
        };
        let peer = InterestSet {
            readable: self.downstream.wants_read(),
            writable: self.upstream.wants_write(),
        };

        self.client.sync(reactor, client).map_err(RelayError::Reactor)?;
        self.peer.sync(reactor, peer).map_err(RelayError::Reactor)?;
        Ok(())
    }
}

fn pump_channel(
    channel: &mut FlowControlledChannel,
    source: &mut TcpStream,
    destination: &mut TcpStream,
) -> Result<bool, RelayError> {
    let mut progress = false;

    if channel.can_read() {
        let was_eof = channel.source_eof();
        let n = channel.on_source_readable(source)?;
        progress |= n > 0 || channel.source_eof() != was_eof;
    }
    if channel.can_write() {
        progress |= channel.on_destination_writable(destination)? > 0;
    }

    Ok(progress)
}

fn shutdown_write(stream: &TcpStream, direction: Direction) -> Result<(), RelayError> {
    stream
        .shutdown(Shutdown::Write)
        .map_err(|source| RelayError::Shutdown {
            direction,
            side: direction.destination(),
            source,
        })
}
