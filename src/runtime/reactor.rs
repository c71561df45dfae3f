//! Readiness notification.
//!
//! The relay talks to the host's I/O multiplexer only through the
//! `Reactor` trait. `MioReactor` is the production implementation; mio is
//! edge-triggered, so callers must keep reading or writing until a socket
//! reports "would block".

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// Desired readiness for one socket. May be empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestSet {
    pub readable: bool,
    pub writable: bool,
}

impl InterestSet {
    pub const NONE: InterestSet = InterestSet {
        readable: false,
        writable: false,
    };
    pub const READABLE: InterestSet = InterestSet {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: InterestSet = InterestSet {
        readable: false,
        writable: true,
    };

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    /// mio equivalent; `None` for the empty set, which mio cannot register.
    pub fn to_mio(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// One readiness event observed by `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// Registration and wait operations the relay depends on.
pub trait Reactor {
    /// Start watching `source`. `interest` must not be empty.
    fn register<S>(&mut self, source: &mut S, token: Token, interest: InterestSet) -> io::Result<()>
    where
        S: Source + ?Sized;

    /// Replace the interest set of an already registered `source`.
    fn modify<S>(&mut self, source: &mut S, token: Token, interest: InterestSet) -> io::Result<()>
    where
        S: Source + ?Sized;

    /// Stop watching `source`.
    fn deregister<S>(&mut self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized;

    /// Block until at least one source is ready or `timeout` elapses.
    ///
    /// Events are appended to `ready` in the order the multiplexer reported them.
    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// `Reactor` over `mio::Poll` (epoll on Linux, kqueue on macOS).
pub struct MioReactor {
    poll: Poll,
    events: Events,
}

impl MioReactor {
    /// Create a reactor that reports up to `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

fn empty_interest() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "empty interest set")
}

impl Reactor for MioReactor {
    fn register<S>(&mut self, source: &mut S, token: Token, interest: InterestSet) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let interest = interest.to_mio().ok_or_else(empty_interest)?;
        self.poll.registry().register(source, token, interest)
    }

    fn modify<S>(&mut self, source: &mut S, token: Token, interest: InterestSet) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let interest = interest.to_mio().ok_or_else(empty_interest)?;
        self.poll.registry().reregister(source, token, interest)
    }

    fn deregister<S>(&mut self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal cut the wait short; report no events
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        ready.extend(self.events.iter().map(Readiness::from_event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Write;

    #[test]
    fn test_interest_set_conversion() {
        assert_eq!(InterestSet::NONE.to_mio(), None);
        assert!(InterestSet::NONE.is_empty());
        assert_eq!(InterestSet::READABLE.to_mio(), Some(Interest::READABLE));
        assert_eq!(InterestSet::WRITABLE.to_mio(), Some(Interest::WRITABLE));

        let both = InterestSet {
            readable: true,
            writable: true,
        };
        assert_eq!(both.to_mio(), Some(Interest::READABLE | Interest::WRITABLE));
    }

    #[test]
    fn test_register_rejects_empty_interest() {
        let mut reactor = MioReactor::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = reactor
            .register(&mut listener, Token(0), InterestSet::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_wait_reports_readable_listener() {
        let mut reactor = MioReactor::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        reactor
            .register(&mut listener, Token(3), InterestSet::READABLE)
            .unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut ready = Vec::new();
        for _ in 0..50 {
            reactor
                .wait(&mut ready, Some(Duration::from_millis(100)))
                .unwrap();
            if !ready.is_empty() {
                break;
            }
        }
        assert!(ready.iter().any(|r| r.token == Token(3) && r.readable));

        // Timeout with nothing registered as ready returns no events
        let (_stream, _) = listener.accept().unwrap();
        reactor.deregister(&mut listener).unwrap();
        ready.clear();
        reactor
            .wait(&mut ready, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(ready.is_empty());
    }
}
