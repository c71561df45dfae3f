//! One direction of a relay.
//!
//! A channel drains its source socket into a ring buffer and drains the
//! ring buffer into its destination socket. The relay owns both sockets
//! and passes them in per call; the channel owns the buffer, the EOF flag
//! and the cached readiness of each side.
//!
//! Readiness is edge-triggered, so both callbacks loop until the socket
//! reports `WouldBlock` or the buffer stops them (full on the read side,
//! empty on the write side). Readiness seen while the buffer blocked
//! progress stays cached and is acted on as soon as room or data appears.

use crate::runtime::buffer::RingBuffer;
use crate::runtime::error::{BufferError, Direction, RelayError};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};

/// Buffered, backpressured byte pipe from one socket to another.
#[derive(Debug)]
pub struct FlowControlledChannel {
    direction: Direction,
    buffer: RingBuffer,
    /// Source returned 0 bytes.
    source_eof: bool,
    /// Source may have bytes we have not read yet.
    source_ready: bool,
    /// Destination last reported `WouldBlock`.
    write_blocked: bool,
    /// Destination write side has been shut down.
    finished: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl FlowControlledChannel {
    pub fn new(direction: Direction, buffer_size: usize) -> Result<Self, BufferError> {
        Ok(Self {
            direction,
            buffer: RingBuffer::new(buffer_size)?,
            source_eof: false,
            source_ready: false,
            write_blocked: false,
            finished: false,
            bytes_read: 0,
            bytes_written: 0,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The reactor reported the source readable.
    pub fn mark_source_ready(&mut self) {
        self.source_ready = true;
    }

    /// The reactor reported the destination writable.
    pub fn mark_destination_ready(&mut self) {
        self.write_blocked = false;
    }

    /// Whether the source should be registered for read interest.
    pub fn wants_read(&self) -> bool {
        !self.source_eof && !self.buffer.is_full()
    }

    /// Whether the destination should be registered for write interest.
    pub fn wants_write(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Whether a read attempt could make progress now.
    pub fn can_read(&self) -> bool {
        self.source_ready && self.wants_read()
    }

    /// Whether a write attempt could make progress now.
    pub fn can_write(&self) -> bool {
        !self.write_blocked && self.wants_write()
    }

    pub fn source_eof(&self) -> bool {
        self.source_eof
    }

    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    /// Source is exhausted and everything read has been delivered.
    pub fn is_drained(&self) -> bool {
        self.source_eof && self.buffer.is_empty()
    }

    /// Destination has been half-closed; the channel is done.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Bytes read from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes delivered to the destination so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes buffered but not yet delivered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read from `source` into free buffer space until it would block,
    /// reaches EOF or the buffer fills.
    ///
    /// Returns the number of bytes read. A full buffer makes this a no-op.
    pub fn on_source_readable<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<usize, RelayError> {
        let mut total = 0;

        while self.wants_read() {
            let (head, wrap) = self.buffer.free_slices_mut();
            let mut spans = [IoSliceMut::new(head), IoSliceMut::new(wrap)];

            match source.read_vectored(&mut spans) {
                Ok(0) => {
                    self.source_eof = true;
                }
                Ok(n) => {
                    self.buffer.commit(n);
                    self.bytes_read += n as u64;
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.source_ready = false;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RelayError::Read {
                        direction: self.direction,
                        side: self.direction.source(),
                        source: e,
                    });
                }
            }
        }

        Ok(total)
    }

    /// Write buffered bytes to `destination` until it would block or the
    /// buffer drains. Partial writes just advance the read cursor.
    ///
    /// Returns the number of bytes written.
    pub fn on_destination_writable<W: Write + ?Sized>(
        &mut self,
        destination: &mut W,
    ) -> Result<usize, RelayError> {
        let mut total = 0;

        while self.wants_write() {
            let (head, wrap) = self.buffer.as_slices();
            let spans = [IoSlice::new(head), IoSlice::new(wrap)];

            let result = match destination.write_vectored(&spans) {
                Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                other => other,
            };

            match result {
                Ok(n) => {
                    self.buffer.consume(n);
                    self.bytes_written += n as u64;
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RelayError::Write {
                        direction: self.direction,
                        side: self.direction.destination(),
                        source: e,
                    });
                }
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Destination that never accepts bytes.
    struct Stalled;

    impl Write for Stalled {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Destination that accepts at most `budget` bytes, then blocks.
    struct Trickle {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Source that yields its chunks, then blocks forever.
    struct Chunks(Vec<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.first_mut() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.0.remove(0);
                    }
                    Ok(n)
                }
            }
        }
    }

    struct Broken(io::ErrorKind);

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(self.0.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_backpressure_stops_reading_when_full() {
        let mut channel = FlowControlledChannel::new(Direction::Upstream, 4).unwrap();
        let mut source = Cursor::new(b"0123456789".to_vec());

        channel.mark_source_ready();
        assert_eq!(channel.on_source_readable(&mut source).unwrap(), 4);
        assert!(!channel.wants_read());
        assert!(channel.wants_write());

        // Stalled destination keeps the buffer full
        channel.mark_destination_ready();
        assert_eq!(channel.on_destination_writable(&mut Stalled).unwrap(), 0);
        assert!(channel.is_write_blocked());

        // Further readiness has no effect while full
        assert_eq!(channel.on_source_readable(&mut source).unwrap(), 0);
        assert_eq!(source.position(), 4);
        assert!(!channel.can_read());

        // One byte of room re-enables reading
        channel.mark_destination_ready();
        let mut trickle = Trickle {
            accepted: Vec::new(),
            budget: 1,
        };
        assert_eq!(channel.on_destination_writable(&mut trickle).unwrap(), 1);
        assert_eq!(trickle.accepted, b"0");
        assert!(channel.wants_read());
        assert!(channel.can_read());

        assert_eq!(channel.on_source_readable(&mut source).unwrap(), 1);
        assert_eq!(source.position(), 5);
    }

    #[test]
    fn test_eof_then_drain() {
        let mut channel = FlowControlledChannel::new(Direction::Downstream, 16).unwrap();
        let mut source = Cursor::new(b"hello".to_vec());

        channel.mark_source_ready();
        assert_eq!(channel.on_source_readable(&mut source).unwrap(), 5);
        assert!(channel.source_eof());
        assert!(!channel.wants_read());
        assert!(!channel.is_drained());

        let mut sink = Vec::new();
        channel.mark_destination_ready();
        assert_eq!(channel.on_destination_writable(&mut sink).unwrap(), 5);
        assert_eq!(sink, b"hello");
        assert!(channel.is_drained());
        assert!(!channel.wants_write());
        assert_eq!(channel.bytes_read(), 5);
        assert_eq!(channel.bytes_written(), 5);
    }

    #[test]
    fn test_would_block_clears_source_readiness() {
        let mut channel = FlowControlledChannel::new(Direction::Upstream, 64).unwrap();
        let mut source = Chunks(vec![b"abc".to_vec(), b"def".to_vec()]);

        channel.mark_source_ready();
        assert_eq!(channel.on_source_readable(&mut source).unwrap(), 6);
        assert!(!channel.source_eof());
        assert!(!channel.can_read());
        assert_eq!(channel.buffered(), 6);
    }

    #[test]
    fn test_partial_writes_preserve_order_across_wrap() {
        let mut channel = FlowControlledChannel::new(Direction::Upstream, 5).unwrap();
        let mut source = Chunks(vec![b"abcdefghijkl".to_vec()]);
        let mut trickle = Trickle {
            accepted: Vec::new(),
            budget: 0,
        };

        while trickle.accepted.len() < 12 {
            channel.mark_source_ready();
            channel.on_source_readable(&mut source).unwrap();
            trickle.budget = 3;
            channel.mark_destination_ready();
            channel.on_destination_writable(&mut trickle).unwrap();
        }

        assert_eq!(trickle.accepted, b"abcdefghijkl");
        assert_eq!(channel.bytes_written(), 12);
    }

    #[test]
    fn test_write_error_is_fatal() {
        let mut channel = FlowControlledChannel::new(Direction::Upstream, 8).unwrap();
        channel.mark_source_ready();
        channel
            .on_source_readable(&mut Cursor::new(b"data".to_vec()))
            .unwrap();

        channel.mark_destination_ready();
        let err = channel
            .on_destination_writable(&mut Broken(io::ErrorKind::ConnectionReset))
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Write {
                direction: Direction::Upstream,
                ..
            }
        ));
        assert!(err.is_remote());
    }

    #[test]
    fn test_write_zero_is_fatal() {
        let mut channel = FlowControlledChannel::new(Direction::Downstream, 8).unwrap();
        channel.mark_source_ready();
        channel
            .on_source_readable(&mut Cursor::new(b"x".to_vec()))
            .unwrap();

        channel.mark_destination_ready();
        let mut full: &mut [u8] = &mut [];
        let err = channel.on_destination_writable(&mut full).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::WriteZero));
    }

    #[test]
    fn test_empty_buffer_never_writes() {
        let mut channel = FlowControlledChannel::new(Direction::Upstream, 8).unwrap();
        channel.mark_destination_ready();
        // Broken destination would fail if touched
        let written = channel
            .on_destination_writable(&mut Broken(io::ErrorKind::Other))
            .unwrap();
        assert_eq!(written, 0);
    }
}
