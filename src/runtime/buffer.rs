//! Growable byte buffer for connection I/O.
//!
//! Every connection owns one input and one output `Buffer`. Bytes live in a
//! single contiguous region between a read offset (`begin`) and a write offset
//! (`end`). When the tail runs out of room the unread bytes are either shifted
//! back to offset 0 or moved into a larger allocation:
//!
//! - unread + incoming < capacity / 2: compact in place
//! - otherwise: reallocate to `max(2 * capacity, unread + incoming)`
//!
//! Buffers never reject writes, they only grow.

use std::io;

/// Initial capacity of a connection buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Contiguous append/consume byte buffer.
///
/// Invariant: `begin <= end <= capacity`.
#[derive(Debug, Clone)]
pub struct Buffer {
    /// Backing storage; its length is the capacity.
    data: Vec<u8>,
    /// Offset of the first unread byte.
    begin: usize,
    /// Offset one past the last written byte.
    end: usize,
}

impl Buffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a buffer with `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)],
            begin: 0,
            end: 0,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Check if there are no unread bytes.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Current size of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Writable bytes after the tail (space before `begin` excluded).
    pub fn space(&self) -> usize {
        self.capacity() - self.end
    }

    /// Unread bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    /// Drop all unread bytes and reset both offsets.
    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// Advance the read offset by `n` bytes (clamped to `len()`).
    ///
    /// Once the buffer drains, both offsets go back to the origin so they
    /// never drift.
    pub fn consume(&mut self, n: usize) {
        self.begin += n.min(self.len());
        if self.is_empty() {
            self.clear();
        }
    }

    /// Reserve `n` writable bytes at the tail and return them.
    ///
    /// The bytes count as written immediately; callers fill the returned
    /// slice in place.
    pub fn occupy(&mut self, n: usize) -> &mut [u8] {
        self.make_room(n);
        let start = self.end;
        self.end += n;
        &mut self.data[start..self.end]
    }

    /// Copy `bytes` to the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.occupy(bytes.len()).copy_from_slice(bytes);
    }

    /// Append a `u32` in network byte order.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Read a network-order `u32` at `offset` bytes past the read offset
    /// without consuming anything.
    pub fn peek_u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.as_slice().get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite the `u32` at `offset` bytes past the read offset, in
    /// network byte order. The bytes must already be written.
    pub fn set_u32_at(&mut self, offset: usize, value: u32) {
        let start = self.begin + offset;
        debug_assert!(start + 4 <= self.end, "set_u32_at past the tail");
        self.data[start..start + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Read and consume a network-order `u32`.
    pub fn fetch_u32(&mut self) -> Option<u32> {
        let value = self.peek_u32_at(0)?;
        self.consume(4);
        Some(value)
    }

    /// Copy up to `dest.len()` unread bytes out and consume them.
    pub fn fetch(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.len());
        dest[..n].copy_from_slice(&self.data[self.begin..self.begin + n]);
        self.consume(n);
        n
    }

    /// Take every unread byte out of the buffer.
    pub fn take_all(&mut self) -> Vec<u8> {
        let bytes = self.as_slice().to_vec();
        self.clear();
        bytes
    }

    /// Writable tail with at least `min` bytes, for reading straight from a
    /// socket. Follow up with [`Buffer::commit`].
    pub fn spare(&mut self, min: usize) -> &mut [u8] {
        self.make_room(min);
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the spare tail as written.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.space(), "commit past capacity");
        self.end += n.min(self.space());
    }

    fn make_room(&mut self, needed: usize) {
        if self.space() >= needed {
            return;
        }
        if self.len() + needed < self.capacity() / 2 {
            self.compact();
        } else {
            self.grow(needed);
        }
    }

    fn compact(&mut self) {
        if self.begin == 0 {
            return;
        }
        self.data.copy_within(self.begin..self.end, 0);
        self.end -= self.begin;
        self.begin = 0;
    }

    fn grow(&mut self, needed: usize) {
        let len = self.len();
        let new_capacity = (2 * self.capacity()).max(len + needed);
        let mut data = vec![0u8; new_capacity];
        data[..len].copy_from_slice(self.as_slice());
        self.data = data;
        self.begin = 0;
        self.end = len;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_append_consume_resets_offsets() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"hello world");
        assert_eq!(buf.len(), 11);

        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.begin, 6);

        buf.consume(buf.len());
        assert!(buf.is_empty());
        assert_eq!((buf.begin, buf.end), (0, 0));
    }

    #[test]
    fn test_consume_is_clamped() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"abc");
        buf.consume(100);
        assert!(buf.is_empty());
        assert_eq!((buf.begin, buf.end), (0, 0));
    }

    #[test]
    fn test_compacts_when_mostly_consumed() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 30]);
        buf.consume(28);

        // 2 unread + 4 incoming < 16: shift in place, no reallocation
        buf.append(&[2u8; 4]);
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.begin, 0);
        assert_eq!(buf.as_slice(), &[1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_grows_when_full() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"12345678");
        buf.append(b"9");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.as_slice(), b"123456789");

        // A single large append jumps straight to the needed size
        buf.append(&[0u8; 100]);
        assert_eq!(buf.capacity(), 109);
        assert_eq!(buf.len(), 109);
    }

    #[test]
    fn test_occupy_writes_in_place() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(b"ab");
        buf.occupy(3).copy_from_slice(b"cde");
        assert_eq!(buf.as_slice(), b"abcde");
    }

    #[test]
    fn test_u32_network_order() {
        let mut buf = Buffer::new();
        buf.append_u32(0x0102_0304);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(buf.peek_u32_at(0), Some(0x0102_0304));
        assert_eq!(buf.peek_u32_at(1), None);
        assert_eq!(buf.fetch_u32(), Some(0x0102_0304));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_set_u32_patches_in_place() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"xy");
        buf.consume(1);
        buf.append_u32(0);
        buf.append(b"z");
        buf.set_u32_at(1, 0xdead_beef);
        assert_eq!(buf.peek_u32_at(1), Some(0xdead_beef));
        assert_eq!(buf.as_slice()[0], b'y');
        assert_eq!(buf.as_slice()[5], b'z');
    }

    #[test]
    fn test_spare_and_commit() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(b"xy");
        let spare = buf.spare(10);
        assert!(spare.len() >= 10);
        spare[..3].copy_from_slice(b"123");
        buf.commit(3);
        assert_eq!(buf.as_slice(), b"xy123");
    }

    #[test]
    fn test_fetch_and_take_all() {
        let mut buf = Buffer::new();
        buf.write_all(b"payload").unwrap();

        let mut head = [0u8; 3];
        assert_eq!(buf.fetch(&mut head), 3);
        assert_eq!(&head, b"pay");
        assert_eq!(buf.take_all(), b"load");
        assert!(buf.is_empty());
    }
}
