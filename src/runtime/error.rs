//! Error taxonomy for the relay runtime.
//!
//! "Would block" and clean EOF are not represented here: the channel
//! reports them through its readiness and EOF flags. Everything in this
//! module is either a construction failure or fatal for one relay.

use crate::runtime::token::Side;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Ring buffer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// A ring buffer needs at least one byte of storage.
    #[error("ring buffer capacity must be non-zero")]
    ZeroCapacity,

    /// Storage for the buffer could not be reserved.
    #[error("failed to allocate {capacity} bytes of ring buffer storage")]
    Allocation { capacity: usize },

    /// A push was larger than the free capacity. The buffer is unchanged.
    #[error("push of {requested} bytes exceeds free capacity of {available} bytes")]
    Overflow { requested: usize, available: usize },
}

/// Direction of one flow-controlled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to peer.
    Upstream,
    /// Peer to client.
    Downstream,
}

impl Direction {
    /// Endpoint the channel reads from.
    pub fn source(self) -> Side {
        match self {
            Direction::Upstream => Side::Client,
            Direction::Downstream => Side::Peer,
        }
    }

    /// Endpoint the channel writes to.
    pub fn destination(self) -> Side {
        match self {
            Direction::Upstream => Side::Peer,
            Direction::Downstream => Side::Client,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// Errors that tear down a relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connect to upstream {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{direction} read from {side} failed: {source}")]
    Read {
        direction: Direction,
        side: Side,
        #[source]
        source: io::Error,
    },

    #[error("{direction} write to {side} failed: {source}")]
    Write {
        direction: Direction,
        side: Side,
        #[source]
        source: io::Error,
    },

    #[error("{direction} half-close of {side} failed: {source}")]
    Shutdown {
        direction: Direction,
        side: Side,
        #[source]
        source: io::Error,
    },

    #[error("reactor registration failed: {0}")]
    Reactor(#[source] io::Error),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl RelayError {
    /// Direction the failure occurred on, if it belongs to one channel.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RelayError::Read { direction, .. }
            | RelayError::Write { direction, .. }
            | RelayError::Shutdown { direction, .. } => Some(*direction),
            _ => None,
        }
    }

    /// Underlying I/O error kind, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            RelayError::Connect { source, .. }
            | RelayError::Read { source, .. }
            | RelayError::Write { source, .. }
            | RelayError::Shutdown { source, .. }
            | RelayError::Reactor(source) => Some(source.kind()),
            RelayError::Buffer(_) => None,
        }
    }

    /// Whether the remote endpoint caused the failure (reset, abort, broken pipe).
    pub fn is_remote(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Upstream.source(), Side::Client);
        assert_eq!(Direction::Upstream.destination(), Side::Peer);
        assert_eq!(Direction::Downstream.source(), Side::Peer);
        assert_eq!(Direction::Downstream.destination(), Side::Client);
    }

    #[test]
    fn test_remote_classification() {
        let reset = RelayError::Write {
            direction: Direction::Upstream,
            side: Side::Peer,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(reset.is_remote());
        assert_eq!(reset.direction(), Some(Direction::Upstream));

        let other = RelayError::Read {
            direction: Direction::Downstream,
            side: Side::Peer,
            source: io::Error::new(io::ErrorKind::Other, "boom"),
        };
        assert!(!other.is_remote());

        let overflow = RelayError::from(BufferError::Overflow {
            requested: 4,
            available: 1,
        });
        assert!(!overflow.is_remote());
        assert_eq!(overflow.direction(), None);
        assert_eq!(
            overflow.to_string(),
            "push of 4 bytes exceeds free capacity of 1 bytes"
        );
    }
}
