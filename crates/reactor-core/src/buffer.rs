use std::io;
use std::os::unix::io::RawFd;

/// Cheap prepend space reserved at the front of every [`Buffer`], so a caller
/// can prepend a length header without shifting the readable region.
const PREPEND_SIZE: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Auxiliary on-stack buffer used by [`Buffer::read_fd`] so a single `readv`
/// can drain a socket regardless of how large the next message turns out to
/// be, without growing the steady-state buffer for the common case.
const READV_EXTRA_SIZE: usize = 64 * 1024;

/// A growable byte buffer with a prependable prefix, a readable region and a
/// writable tail, used as both the receive and send queue of a
/// [`crate::TcpConnection`].
///
/// Layout: `0 <= prependable <= reader <= writer <= capacity`.
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer { buf: vec![0u8; PREPEND_SIZE + initial_size], reader: PREPEND_SIZE, writer: PREPEND_SIZE }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Capacity of the underlying storage. Never shrinks.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advances the reader index by `min(len, readable_bytes())`. If this
    /// drains the buffer completely, resets both indices so prependable
    /// space is reclaimed.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = PREPEND_SIZE;
        self.writer = PREPEND_SIZE;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let v = self.peek()[..len].to_vec();
        self.retrieve(len);
        v
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Recovers space by shifting the readable region back to
    /// `PREPEND_SIZE` first; only grows the backing storage if that isn't
    /// enough.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_SIZE {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, PREPEND_SIZE);
            self.reader = PREPEND_SIZE;
            self.writer = PREPEND_SIZE + readable;
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Prepends `data` into the reserved prefix. Panics if `data` is larger
    /// than `prependable_bytes()`; callers are expected to size their
    /// headers (e.g. a 4-byte length prefix) within `PREPEND_SIZE`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend data exceeds reserved prefix");
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Reads from `fd` into the buffer using a single `readv` over two
    /// segments: the buffer's own writable tail, and a 64 KiB on-stack
    /// auxiliary buffer. This bounds the buffer's steady-state size while
    /// still draining an arbitrarily large message in one syscall.
    ///
    /// Returns `Ok(0)` on EOF, same as a plain `read`.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; READV_EXTRA_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer).cast() },
                iov_len: writable,
            },
            libc::iovec { iov_base: extra_buf.as_mut_ptr().cast(), iov_len: extra_buf.len() },
        ];
        let iovcnt = if writable < extra_buf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Issues a single non-blocking write of the whole readable region.
    /// Does not advance the reader; the caller does so based on the
    /// returned count.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        let n = unsafe { libc::write(fd, readable.as_ptr().cast(), readable.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_all_roundtrips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
    }

    #[test]
    fn split_append_concatenates() {
        let mut buf = Buffer::new();
        buf.append(b"AB");
        buf.append(b"CD");
        assert_eq!(buf.retrieve_all_as_string(), "ABCD");
    }

    #[test]
    fn retrieve_all_resets_indices_to_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"12345");
        buf.retrieve(5);
        assert_eq!(buf.prependable_bytes(), PREPEND_SIZE);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn partial_retrieve_leaves_remainder_readable() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.retrieve_as_string(2), "he");
        assert_eq!(buf.retrieve_all_as_string(), "llo");
    }

    #[test]
    fn capacity_never_shrinks_across_growth() {
        let mut buf = Buffer::new();
        let initial_cap = buf.capacity();
        buf.append(&vec![0u8; initial_cap * 4]);
        let grown_cap = buf.capacity();
        assert!(grown_cap >= initial_cap);
        buf.retrieve_all();
        assert_eq!(buf.capacity(), grown_cap);
    }

    #[test]
    fn make_space_reuses_prefix_instead_of_growing_when_possible() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[1u8; 40]);
        buf.retrieve(40);
        let cap_before = buf.capacity();
        // Now reader == writer == PREPEND_SIZE with plenty of writable space;
        // appending should not need to grow.
        buf.append(&[2u8; 40]);
        assert_eq!(buf.capacity(), cap_before);
    }

    #[test]
    fn prepend_writes_into_reserved_prefix() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        let mut all = buf.retrieve_as_bytes(4 + "payload".len());
        let header = all.drain(..4).collect::<Vec<_>>();
        assert_eq!(u32::from_be_bytes(header.try_into().unwrap()), 7);
        assert_eq!(all, b"payload");
    }
}
