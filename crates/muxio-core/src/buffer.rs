//! Growable byte buffer for non-blocking socket I/O.
//!
//! The storage is one contiguous allocation split into three regions:
//!
//! ```text
//! +-----------------+---------------------+--------------------+
//! |   prependable   |       readable      |      writable      |
//! +-----------------+---------------------+--------------------+
//! 0            read_index            write_index        storage.len()
//! ```
//!
//! The producer appends at the tail, the consumer retrieves from the head.
//! The first `CHEAP_PREPEND` bytes are kept as slack so a length header can
//! be prepended without moving data. Not thread-safe: a buffer belongs to
//! exactly one connection, confined to that connection's loop thread.

use std::io::IoSliceMut;

use nix::errno::Errno;

use crate::error::{last_errno, Error, Result};

/// Reserved slack at the front for cheap header prepends.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// On-stack spill buffer size for [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

const CRLF: &[u8] = b"\r\n";

pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            storage: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// Total storage size. Always equals
    /// `prependable_bytes() + readable_bytes() + writable_bytes()`.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Offset (into the readable region) of the first CRLF, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first CRLF at or after `start`, if any.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        let haystack = &self.peek()[start..];
        haystack
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset of the first `\n`, if any.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Consume `len` readable bytes.
    ///
    /// Asking for more than is readable is a defined failure that leaves the
    /// buffer untouched.
    pub fn retrieve(&mut self, len: usize) -> Result<()> {
        let readable = self.readable_bytes();
        if len > readable {
            return Err(Error::BufferUnderflow {
                requested: len,
                readable,
            });
        }
        if len < readable {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
        Ok(())
    }

    /// Consume readable bytes up to (not including) offset `end`.
    pub fn retrieve_until(&mut self, end: usize) -> Result<()> {
        self.retrieve(end)
    }

    /// Consume everything readable and reset both indices to the slack.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume `len` bytes and return them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let readable = self.readable_bytes();
        if len > readable {
            return Err(Error::BufferUnderflow {
                requested: len,
                readable,
            });
        }
        let out = self.peek()[..len].to_vec();
        self.retrieve(len)?;
        Ok(out)
    }

    /// Consume everything readable and return it.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Consume everything readable as a string (lossy on invalid UTF-8).
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    /// Append always succeeds; storage grows or compacts as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write `data` into the prependable slack, immediately before the
    /// readable region. Panics if the slack is too small; headers are
    /// expected to fit in `CHEAP_PREPEND` bytes.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        let start = self.read_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    /// Roll back the last `len` written bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.write_index -= len;
    }

    /// Rebuild the storage sized to the current readable bytes plus
    /// `reserve`. Releases memory held by long-idle connections.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Guarantee at least `len` writable bytes.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Mark `len` bytes (written externally into the writable region) as
    /// readable.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    // ── Network-byte-order helpers ──────────────────────────────────

    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.append(&v.to_be_bytes());
    }

    pub fn prepend_u32(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }

    pub fn peek_u32(&self) -> Result<u32> {
        let readable = self.readable_bytes();
        if readable < 4 {
            return Err(Error::BufferUnderflow {
                requested: 4,
                readable,
            });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.peek()[..4]);
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self.peek_u32()?;
        self.retrieve(4)?;
        Ok(v)
    }

    /// One scatter-read from `fd` into the writable tail plus an on-stack
    /// spill buffer. Returns the number of bytes read; `EAGAIN` and every
    /// other failure surface as the captured errno, never a panic.
    pub fn read_fd(&mut self, fd: libc::c_int) -> std::result::Result<usize, Errno> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let tail = &mut self.storage[self.write_index..];
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            // Skip the spill buffer when the tail alone is big enough,
            // saving one copy on large buffers.
            let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
            unsafe {
                libc::readv(
                    fd,
                    iov.as_mut_ptr() as *mut libc::iovec,
                    iovcnt as libc::c_int,
                )
            }
        };

        if n < 0 {
            return Err(last_errno());
        }
        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Grow or compact so at least `len` bytes are writable.
    ///
    /// When the total free space (writable plus prependable beyond the
    /// reserved slack) cannot fit `len`, the storage is resized. Otherwise
    /// the readable region is moved to the front, just after the slack, so
    /// repeated small appends after reads do not grow the storage forever.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write_index + len, 0);
        } else {
            assert!(CHEAP_PREPEND <= self.read_index);
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_law_holds(buf: &Buffer) -> bool {
        buf.prependable_bytes() + buf.readable_bytes() + buf.writable_bytes() == buf.capacity()
    }

    #[test]
    fn test_new_buffer_regions() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert!(region_law_holds(&buf));
    }

    #[test]
    fn test_append_retrieve_fifo_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert!(region_law_holds(&buf));
        assert_eq!(buf.readable_bytes(), 11);

        let first = buf.retrieve_as_bytes(6).unwrap();
        assert_eq!(first, b"hello ");
        assert_eq!(buf.retrieve_all_as_bytes(), b"world");
        assert_eq!(buf.readable_bytes(), 0);
        assert!(region_law_holds(&buf));
    }

    #[test]
    fn test_retrieve_too_much_is_defined_failure() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        let err = buf.retrieve(4).unwrap_err();
        assert_eq!(
            err,
            Error::BufferUnderflow {
                requested: 4,
                readable: 3
            }
        );
        // State untouched; subsequent valid operations still see the data.
        assert_eq!(buf.readable_bytes(), 3);
        assert_eq!(buf.retrieve_all_as_bytes(), b"abc");
    }

    #[test]
    fn test_grow_on_large_append() {
        let mut buf = Buffer::new();
        let big = vec![b'x'; INITIAL_SIZE + 300];
        buf.append(&big);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 300);
        assert!(region_law_holds(&buf));
    }

    #[test]
    fn test_compaction_instead_of_growth() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700).unwrap();
        let cap_before = buf.capacity();
        // 100 readable bytes, 224 writable; compaction must make room for
        // 600 more without resizing.
        buf.append(&vec![b'b'; 600]);
        assert_eq!(buf.capacity(), cap_before);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        let bytes = buf.retrieve_all_as_bytes();
        assert!(bytes[..100].iter().all(|&b| b == b'a'));
        assert!(bytes[100..].iter().all(|&b| b == b'b'));
    }

    #[test]
    fn test_prepend_into_slack() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_u32(7);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.read_u32().unwrap(), 7);
        assert_eq!(buf.retrieve_all_as_bytes(), b"payload");
    }

    #[test]
    fn test_find_crlf_http_request_line() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        // First CRLF terminates the 14-byte request line.
        let crlf = buf.find_crlf().expect("CRLF present");
        assert_eq!(crlf, 14);
        buf.retrieve_until(crlf + 2).unwrap();
        assert_eq!(buf.readable_bytes(), 9); // "Host: x\r\n"
        assert_eq!(buf.find_crlf(), Some(7));
        assert_eq!(buf.find_crlf_from(7), Some(7));
        assert_eq!(buf.find_crlf_from(8), None);
    }

    #[test]
    fn test_find_eol() {
        let mut buf = Buffer::new();
        buf.append(b"line one\nrest");
        assert_eq!(buf.find_eol(), Some(8));
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    fn test_shrink_releases_storage() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'z'; 16_384]);
        buf.retrieve(16_000).unwrap();
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 384);
        assert_eq!(buf.capacity(), CHEAP_PREPEND + 384);
        assert!(region_law_holds(&buf));
    }

    #[test]
    fn test_unwrite() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.unwrite(2);
        assert_eq!(buf.retrieve_all_as_bytes(), b"abcd");
    }

    #[test]
    fn test_be_integer_helpers() {
        let mut buf = Buffer::new();
        buf.append_u16(0x1234);
        buf.append_u32(0xdeadbeef);
        buf.append_u64(1);
        buf.retrieve(2).unwrap();
        assert_eq!(buf.peek_u32().unwrap(), 0xdeadbeef);
        assert_eq!(buf.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(buf.readable_bytes(), 8);
    }

    #[test]
    fn test_read_fd_from_pipe() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = b"through the pipe";
        let written = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(written as usize, payload.len());

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.retrieve_all_as_bytes(), payload);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_read_fd_nonblocking_empty_pipe_is_eagain() {
        use nix::errno::Errno;

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) },
            0
        );
        let mut buf = Buffer::new();
        assert_eq!(buf.read_fd(fds[0]).unwrap_err(), Errno::EAGAIN);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
