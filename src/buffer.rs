//! Growable byte queue with separate read and write cursors.

use std::io::Error;
use std::os::fd::RawFd;

/// Initial reserve for a fresh [`Buffer`].
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Bytes are appended at the write cursor and consumed from the read cursor.
///
/// A `Buffer` backs the per-connection receive queue, in-memory send nodes,
/// and the staging area of file and stream nodes. Peeking borrows the
/// readable region without consuming it; [`Buffer::retrieve`] consumes.
/// Writable space is reclaimed by compacting before growing, so a buffer
/// that is drained as fast as it fills stays at its initial allocation.
///
/// Invariant: `read_index <= write_index <= data.len()`.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    /// Create a buffer with the default initial reserve.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a buffer with `capacity` bytes of writable space.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be written without reallocating.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// True when there is nothing to read.
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// Borrow the readable region. Valid until the next mutating call.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Consume up to `len` readable bytes. Consuming everything resets both
    /// cursors so the whole allocation becomes writable again.
    pub fn retrieve(&mut self, len: usize) {
        if len >= self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_index += len;
        }
    }

    /// Consume all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Consume all readable bytes, returning them as an owned vector.
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Make room for at least `len` writable bytes, compacting the already
    /// consumed prefix before growing the allocation.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.read_index + self.writable_bytes() >= len {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.read_index = 0;
            self.write_index = readable;
        } else {
            self.data.resize(self.write_index + len, 0);
        }
    }

    /// Borrow the writable region.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_index..]
    }

    /// Commit `len` bytes previously written into [`Buffer::writable_mut`].
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    /// Append bytes at the write cursor.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Fill writable space from a file descriptor in one `readv` call.
    ///
    /// A 64 KiB stack buffer rides along as the second scatter segment so a
    /// single syscall can pull more than the in-place writable region; any
    /// overflow is appended afterwards. Returns the total byte count (0 at
    /// end of stream).
    pub fn read_from_fd(&mut self, fd: RawFd) -> Result<usize, Error> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"llo");
        buf.retrieve(3);
        assert!(buf.is_empty());
        // fully drained buffers reset to the start of the allocation
        assert_eq!(buf.writable_bytes(), DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn over_retrieve_clamps() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn ensure_writable_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"12345678");
        buf.retrieve(6);
        // 2 readable bytes at the tail; room for 6 exists after compaction
        buf.ensure_writable(6);
        assert_eq!(buf.peek(), b"78");
        assert!(buf.writable_bytes() >= 6);
    }

    #[test]
    fn ensure_writable_grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(4);
        buf.append(b"abcd");
        buf.ensure_writable(16);
        assert!(buf.writable_bytes() >= 16);
        assert_eq!(buf.peek(), b"abcd");
    }

    #[test]
    fn writable_mut_then_has_written() {
        let mut buf = Buffer::new();
        buf.writable_mut()[..3].copy_from_slice(b"xyz");
        buf.has_written(3);
        assert_eq!(buf.peek(), b"xyz");
    }

    #[test]
    fn read_all_drains() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        assert_eq!(buf.read_all(), b"payload");
        assert!(buf.is_empty());
    }
}
