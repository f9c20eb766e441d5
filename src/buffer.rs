//! Growable byte buffer with separate read and write cursors.
//!
//! The buffer keeps three regions inside one contiguous allocation:
//!
//! ```text
//! | prependable (>= 8) | readable (payload) | writable |
//! 0            reader_index         writer_index     capacity
//! ```
//!
//! The reserved head room lets a length prefix be prepended to queued data
//! without shifting or reallocating. Draining all readable bytes resets
//! both cursors so the head room is reclaimed.

use std::os::unix::io::RawFd;

use crate::sockets;

/// Reserved head room so a small prefix can be prepended in place.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Read/write cursor buffer used for connection input and output queues.
///
/// Integer helpers use network byte order throughout.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `initial` writable bytes plus head room.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    /// Number of bytes in front of the readable region.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable region, if any.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Advance the read cursor by `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drain the buffer, reclaiming the head room.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drain the readable region into an owned `Vec`.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Drain the readable region into an owned `String` (lossy).
    pub fn take_string(&mut self) -> String {
        let out = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        out
    }

    /// Append `data`, growing or compacting the storage as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Make sure at least `n` bytes are writable.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    // Either grow the storage or shift the readable region back to the
    // head-room offset, whichever frees enough space. Shifting keeps the
    // allocation bounded when the reader keeps up with the writer.
    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.storage.resize(self.writer_index + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Write `data` immediately in front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than the prependable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    /// The spare tail capacity, for callers that fill the buffer through
    /// their own syscalls. Pair with [`commit`](Self::commit).
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.storage[start..]
    }

    /// Mark `n` bytes of [`writable_slice`](Self::writable_slice) as
    /// written.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the writable bytes.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.writable_bytes());
        self.writer_index += n;
    }

    /// Replace the storage with one sized to `readable + reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Total size of the underlying allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Append a big-endian `i64`.
    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    /// Append a big-endian `i32`.
    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    /// Append a big-endian `i16`.
    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    /// Append an `i8`.
    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    /// Read a big-endian `i64` and consume it.
    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve(8);
        x
    }

    /// Read a big-endian `i32` and consume it.
    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve(4);
        x
    }

    /// Read a big-endian `i16` and consume it.
    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve(2);
        x
    }

    /// Read an `i8` and consume it.
    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve(1);
        x
    }

    /// Read a big-endian `i64` without consuming it.
    ///
    /// # Panics
    ///
    /// The `peek_*` helpers panic if the readable region is too short.
    pub fn peek_i64(&self) -> i64 {
        i64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    /// Read a big-endian `i32` without consuming it.
    pub fn peek_i32(&self) -> i32 {
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    /// Read a big-endian `i16` without consuming it.
    pub fn peek_i16(&self) -> i16 {
        i16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    /// Read an `i8` without consuming it.
    pub fn peek_i8(&self) -> i8 {
        self.peek()[0] as i8
    }

    /// Prepend a big-endian `i64`.
    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Prepend a big-endian `i32`.
    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    /// Prepend a big-endian `i16`.
    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    /// Prepend an `i8`.
    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    /// Read from `fd` directly into the writable region, spilling into a
    /// 64 KiB stack buffer when the socket delivers more than fits.
    ///
    /// The scatter read means a single syscall drains large bursts without
    /// pre-growing the buffer, while typical reads stay allocation-free.
    /// Returns the total number of bytes read; `Ok(0)` means EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.storage[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // When there is ample writable space the stack buffer is not needed.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = sockets::readv(fd, &iov[..iovcnt])?;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_layout() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve_accounting() {
        let mut buf = Buffer::new();
        buf.append(&[b'x'; 200]);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        buf.retrieve(50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.retrieve(150);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_exactly_initial_size_does_not_grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![0u8; INITIAL_SIZE]);
        assert_eq!(buf.capacity(), CHEAP_PREPEND + INITIAL_SIZE);

        let mut buf = Buffer::new();
        buf.append(&vec![0u8; INITIAL_SIZE + 1]);
        assert!(buf.capacity() > CHEAP_PREPEND + INITIAL_SIZE);
    }

    #[test]
    fn grow_and_compact() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(500);
        // 300 readable; appending 400 fits after shifting left, no growth.
        let cap = buf.capacity();
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(&buf.peek()[..300], &[b'a'; 300][..]);
        assert_eq!(&buf.peek()[300..], &[b'b'; 400][..]);
    }

    #[test]
    fn prepend_uses_head_room() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_i32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn int_round_trips() {
        let mut buf = Buffer::new();
        buf.append_i64(0x0102030405060708);
        buf.append_i32(-2);
        buf.append_i16(300);
        buf.append_i8(-1);
        assert_eq!(buf.readable_bytes(), 15);

        assert_eq!(buf.peek_i64(), 0x0102030405060708);
        assert_eq!(buf.read_i64(), 0x0102030405060708);
        assert_eq!(buf.read_i32(), -2);
        assert_eq!(buf.read_i16(), 300);
        assert_eq!(buf.read_i8(), -1);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn ints_are_big_endian_on_the_wire() {
        let mut buf = Buffer::new();
        buf.append_i16(0x0102);
        assert_eq!(buf.peek(), &[0x01, 0x02]);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), Some(7));
    }

    #[test]
    fn shrink_copies_readable() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'z'; 2000]);
        buf.retrieve(1500);
        buf.shrink(16);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.peek(), &[b'z'; 500][..]);
        assert_eq!(buf.capacity(), CHEAP_PREPEND + 500 + 16);
    }

    #[test]
    fn writable_slice_commit_cycle() {
        let mut buf = Buffer::with_capacity(64);
        let spare = buf.writable_slice();
        assert_eq!(spare.len(), 64);
        spare[..5].copy_from_slice(b"hello");
        buf.commit(5);
        assert_eq!(buf.peek(), b"hello");

        buf.retrieve(2);
        let spare = buf.writable_slice();
        spare[..1].copy_from_slice(b"!");
        buf.commit(1);
        assert_eq!(buf.peek(), b"llo!");
    }

    #[test]
    fn take_drains() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        assert_eq!(buf.take(), b"abc".to_vec());
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn read_fd_spills_into_stack_buffer() {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let payload = vec![b'q'; 4000];
        let wrote = unsafe {
            libc::write(
                fds[1],
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(wrote, 4000);

        let mut buf = Buffer::with_capacity(100);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 4000);
        assert_eq!(buf.readable_bytes(), 4000);
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
