//! Single-threaded relay runtime.
//!
//! Readiness-based I/O on mio (epoll on Linux, kqueue on macOS):
//! - `RingBuffer`: fixed-capacity byte queue per direction
//! - `FlowControlledChannel`: one direction of a relay with backpressure
//! - `Relay`: client/peer state machine
//! - `ProxyServer`: accept loop and event dispatch

mod buffer;
mod channel;
mod error;
mod event_loop;
mod reactor;
mod relay;
mod token;

pub use event_loop::ProxyServer;
pub use reactor::{InterestSet, MioReactor, Reactor, Readiness};
pub use token::LISTENER_TOKEN;

use crate::config::ProxyConfig;

/// Bind the relay listener and serve until a fatal reactor error.
pub fn run(config: &ProxyConfig) -> std::io::Result<()> {
    ProxyServer::bind(config)?.run()
}
