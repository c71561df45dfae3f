//! Readiness token encoding.
//!
//! Each relay owns two sockets, so a token carries both the relay's slab
//! key and which endpoint the event belongs to. The listener uses a
//! reserved token that no relay key can produce.

use mio::Token;
use std::fmt;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// One endpoint of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted downstream connection.
    Client,
    /// The upstream connection the relay dialed.
    Peer,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Peer => f.write_str("peer"),
        }
    }
}

/// Build the token for one endpoint of a relay.
pub fn encode(relay_id: usize, side: Side) -> Token {
    let bit = match side {
        Side::Client => 0,
        Side::Peer => 1,
    };
    Token((relay_id << 1) | bit)
}

/// Split a token back into relay key and endpoint.
///
/// Returns `None` for the listener token.
pub fn decode(token: Token) -> Option<(usize, Side)> {
    if token == LISTENER_TOKEN {
        return None;
    }
    let side = if token.0 & 1 == 0 {
        Side::Client
    } else {
        Side::Peer
    };
    Some((token.0 >> 1, side))
}
