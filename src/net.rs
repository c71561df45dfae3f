//! Socket construction and tuning.
//!
//! Listeners are created through socket2 so address/port reuse, backlog
//! and buffer sizes can be set before `bind`/`listen`. Everything handed
//! to the reactor is non-blocking.

use crate::config::SocketConfig;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;

fn new_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
}

fn apply_buffer_sizes(socket: &SockRef<'_>, options: &SocketConfig) -> io::Result<()> {
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}

/// Create a non-blocking listener bound to `addr`.
pub fn bind_listener(addr: SocketAddr, options: &SocketConfig) -> io::Result<mio::net::TcpListener> {
    let socket = new_socket(addr)?;

    socket.set_reuse_address(options.reuse_address)?;
    #[cfg(unix)]
    socket.set_reuse_port(options.reuse_port)?;
    // Accepted sockets inherit buffer sizes set on the listener
    apply_buffer_sizes(&SockRef::from(&socket), options)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;

    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Start a non-blocking connect to `addr`.
///
/// The returned stream is usually still connecting; completion is
/// signalled by writability.
pub fn connect(addr: SocketAddr, options: &SocketConfig) -> io::Result<mio::net::TcpStream> {
    let socket = new_socket(addr)?;

    apply_buffer_sizes(&SockRef::from(&socket), options)?;
    socket.set_nodelay(options.nodelay)?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(mio::net::TcpStream::from_std(socket.into()))
}

/// Apply per-connection options to an accepted stream.
pub fn tune_stream<S: AsFd>(stream: &S, options: &SocketConfig) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(options.nodelay)?;
    apply_buffer_sizes(&socket, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    #[test]
    fn test_bind_and_connect() {
        let options = SocketConfig {
            recv_buffer_size: Some(256 * 1024),
            ..SocketConfig::default()
        };
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut stream = connect(addr, &options).unwrap();

        // Poll the non-blocking accept until the handshake lands
        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "accept timed out");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        tune_stream(&accepted, &options).unwrap();
        assert!(SockRef::from(&accepted).nodelay().unwrap());

        loop {
            match stream.write(b"ping") {
                Ok(n) => {
                    assert_eq!(n, 4);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "connect timed out");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("write failed: {e}"),
            }
        }

        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            match accepted.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "read timed out");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&buf, b"ping");
    }
}
