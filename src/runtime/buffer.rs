//! Fixed-capacity ring buffer for relayed bytes.
//!
//! One buffer sits between the read side and the write side of a channel.
//! Storage is allocated once and never grows; a full buffer is the
//! backpressure signal for the producer.
//!
//! ## Layout
//!
//! `start` is the first readable byte and `end` is one past the last. When
//! the two are equal the buffer is either empty or full, and `full`
//! records which. Readable bytes and free space are each exposed as at
//! most two contiguous runs: a head run up to the physical end of storage
//! and a wrap run starting at index 0.

use crate::runtime::error::BufferError;

/// Fixed-capacity FIFO byte queue with wraparound storage.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Vec<u8>,
    start: usize,
    end: usize,
    full: bool,
}

impl RingBuffer {
    /// Allocate a buffer of exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::Allocation { capacity })?;
        storage.resize(capacity, 0);

        Ok(Self {
            storage,
            start: 0,
            end: 0,
            full: false,
        })
    }

    /// Total storage size.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes that can still be pushed.
    pub fn free_capacity(&self) -> usize {
        if self.start > self.end {
            self.start - self.end
        } else if self.start < self.end {
            self.capacity() - (self.end - self.start)
        } else if self.full {
            0
        } else {
            self.capacity()
        }
    }

    /// Bytes waiting to be popped.
    pub fn len(&self) -> usize {
        self.capacity() - self.free_capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end && !self.full
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Readable bytes as (head run, wrap run).
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            (&[], &[])
        } else if self.start < self.end {
            (&self.storage[self.start..self.end], &[])
        } else {
            (&self.storage[self.start..], &self.storage[..self.end])
        }
    }

    /// Free space as (head run, wrap run), for reading straight off a socket.
    ///
    /// Bytes written into these runs become visible only after `commit`.
    pub fn free_slices_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.full {
            return (&mut [], &mut []);
        }

        let (start, end) = (self.start, self.end);
        if end >= start {
            let (low, high) = self.storage.split_at_mut(end);
            (high, &mut low[..start])
        } else {
            (&mut self.storage[end..start], &mut [])
        }
    }

    /// Mark `n` bytes of the free runs as written.
    ///
    /// # Panics
    /// Panics if `n` exceeds the free capacity.
    pub fn commit(&mut self, n: usize) {
        let available = self.free_capacity();
        assert!(n <= available, "commit of {n} bytes exceeds free capacity {available}");
        if n == 0 {
            return;
        }
        self.end = (self.end + n) % self.capacity();
        if self.end == self.start {
            self.full = true;
        }
    }

    /// Discard `n` readable bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the readable length.
    pub fn consume(&mut self, n: usize) {
        let occupied = self.len();
        assert!(n <= occupied, "consume of {n} bytes exceeds occupied {occupied}");
        if n == 0 {
            return;
        }
        self.start = (self.start + n) % self.capacity();
        self.full = false;
    }

    /// Append `data`, splitting across the storage boundary if needed.
    ///
    /// Fails without modifying the buffer when `data` does not fit.
    #[allow(dead_code)] // the relay moves bytes through the span methods
    pub fn push_back(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let available = self.free_capacity();
        if data.len() > available {
            return Err(BufferError::Overflow {
                requested: data.len(),
                available,
            });
        }

        let (head, wrap) = self.free_slices_mut();
        let head_len = head.len().min(data.len());
        let wrap_len = data.len() - head_len;
        head[..head_len].copy_from_slice(&data[..head_len]);
        wrap[..wrap_len].copy_from_slice(&data[head_len..]);
        debug_assert_eq!(head_len + wrap_len, data.len());

        self.commit(data.len());
        Ok(())
    }

    /// Copy up to `dest.len()` bytes out of the front of the buffer.
    ///
    /// Returns the number of bytes copied; 0 means the buffer was empty or
    /// `dest` has no room.
    #[allow(dead_code)] // the relay moves bytes through the span methods
    pub fn pop_front(&mut self, dest: &mut [u8]) -> usize {
        if dest.is_empty() || self.is_empty() {
            return 0;
        }

        let (head, wrap) = self.as_slices();
        let head_len = head.len().min(dest.len());
        let wrap_len = wrap.len().min(dest.len() - head_len);
        dest[..head_len].copy_from_slice(&head[..head_len]);
        dest[head_len..head_len + wrap_len].copy_from_slice(&wrap[..wrap_len]);

        let n = head_len + wrap_len;
        self.consume(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer() {
        let buf = RingBuffer::new(16).unwrap();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.free_capacity(), 16);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert!(!buf.is_full());

        assert_eq!(RingBuffer::new(0).unwrap_err(), BufferError::ZeroCapacity);
    }

    #[test]
    fn test_wraparound_round_trip() {
        let mut buf = RingBuffer::new(8).unwrap();
        let mut out = [0u8; 8];

        buf.push_back(b"ABCDE").unwrap();
        assert_eq!(buf.pop_front(&mut out[..3]), 3);
        assert_eq!(&out[..3], b"ABC");
        assert_eq!(buf.free_capacity(), 6);

        // Straddles the end of storage
        buf.push_back(b"FGHI").unwrap();
        assert_eq!(buf.len(), 6);

        assert_eq!(buf.pop_front(&mut out[..6]), 6);
        assert_eq!(&out[..6], b"DEFGHI");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overflow_leaves_buffer_untouched() {
        let mut buf = RingBuffer::new(4).unwrap();
        buf.push_back(b"xyz").unwrap();

        let err = buf.push_back(b"12").unwrap_err();
        assert_eq!(
            err,
            BufferError::Overflow {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_full());

        let mut out = [0u8; 4];
        assert_eq!(buf.pop_front(&mut out), 3);
        assert_eq!(&out[..3], b"xyz");
    }

    #[test]
    fn test_full_then_partial_pop() {
        let mut buf = RingBuffer::new(5).unwrap();
        buf.push_back(b"abcde").unwrap();
        assert!(buf.is_full());
        assert_eq!(buf.free_capacity(), 0);

        // Zero-length pop keeps the buffer full
        assert_eq!(buf.pop_front(&mut []), 0);
        assert!(buf.is_full());

        let mut one = [0u8; 1];
        assert_eq!(buf.pop_front(&mut one), 1);
        assert_eq!(&one, b"a");
        assert_eq!(buf.free_capacity(), 1);
        assert!(!buf.is_full());
    }

    #[test]
    fn test_drain_restores_empty_state() {
        let mut buf = RingBuffer::new(6).unwrap();
        let mut out = [0u8; 6];

        // Move the cursors off zero first
        buf.push_back(b"1234").unwrap();
        buf.pop_front(&mut out[..4]);

        buf.push_back(b"abc").unwrap();
        assert_eq!(buf.pop_front(&mut out), 3);
        assert_eq!(buf.free_capacity(), 6);
        assert!(!buf.is_full());
        assert!(buf.is_empty());

        // Popping an empty buffer is the "no data" result
        assert_eq!(buf.pop_front(&mut out), 0);
    }

    #[test]
    fn test_fill_across_boundary_sets_full() {
        let mut buf = RingBuffer::new(4).unwrap();
        let mut out = [0u8; 4];

        buf.push_back(b"ab").unwrap();
        buf.pop_front(&mut out[..2]);
        buf.push_back(b"cdef").unwrap();
        assert!(buf.is_full());

        let (head, wrap) = buf.as_slices();
        assert_eq!(head, b"cd");
        assert_eq!(wrap, b"ef");

        assert_eq!(buf.pop_front(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn test_free_slices_and_commit() {
        let mut buf = RingBuffer::new(8).unwrap();
        let mut out = [0u8; 8];
        buf.push_back(b"012345").unwrap();
        buf.pop_front(&mut out[..4]);

        {
            let (head, wrap) = buf.free_slices_mut();
            assert_eq!(head.len(), 2);
            assert_eq!(wrap.len(), 4);
            head.copy_from_slice(b"67");
            wrap[..1].copy_from_slice(b"8");
        }
        buf.commit(3);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.pop_front(&mut out), 5);
        assert_eq!(&out[..5], b"45678");
    }

    #[test]
    #[should_panic]
    fn test_commit_past_free_capacity_panics() {
        let mut buf = RingBuffer::new(2).unwrap();
        buf.commit(3);
    }

    #[test]
    fn test_fifo_order_over_many_cycles() {
        let mut buf = RingBuffer::new(7).unwrap();
        let input: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut output = Vec::with_capacity(input.len());
        let mut scratch = [0u8; 5];

        let mut pos = 0;
        while output.len() < input.len() {
            let take = buf.free_capacity().min(3).min(input.len() - pos);
            buf.push_back(&input[pos..pos + take]).unwrap();
            pos += take;

            let n = buf.pop_front(&mut scratch[..2]);
            output.extend_from_slice(&scratch[..n]);
            if pos == input.len() {
                let n = buf.pop_front(&mut scratch);
                output.extend_from_slice(&scratch[..n]);
            }
        }

        assert_eq!(output, input);
    }
}
