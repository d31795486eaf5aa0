use std::cmp;

/// Growable byte buffer with a read cursor and a write cursor.
///
/// The readable region is `[read_idx, write_idx)`; the space behind the
/// read cursor and the space after the write cursor are both writable,
/// so a write that does not fit at the back first slides the readable
/// region down to offset zero before growing the allocation.
pub struct Buffer {
    storage: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

const INITIAL_CAPACITY: usize = 1024;

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            storage: vec![0; cmp::max(capacity, INITIAL_CAPACITY)],
            read_idx: 0,
            write_idx: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_size(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Total writable space, counting both the space after the write
    /// cursor and the reclaimable space in front of the read cursor.
    #[inline]
    pub fn writable_size(&self) -> usize {
        self.back_size() + self.front_size()
    }

    /// View of the readable region.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_idx..self.write_idx]
    }

    #[inline]
    fn front_size(&self) -> usize {
        self.read_idx
    }

    #[inline]
    fn back_size(&self) -> usize {
        self.storage.len() - self.write_idx
    }

    fn advance_read(&mut self, len: usize) {
        assert!(
            self.read_idx + len <= self.write_idx,
            "read cursor advanced past write cursor"
        );
        self.read_idx += len;
    }

    fn advance_write(&mut self, len: usize) {
        assert!(len <= self.back_size(), "write cursor advanced past capacity");
        self.write_idx += len;
    }

    fn ensure_writable(&mut self, len: usize) {
        if len <= self.back_size() {
            return;
        }
        if len > self.writable_size() {
            // Not enough space even after compacting; grow at the back
            // without moving the readable region.
            let grown = self.storage.len() + len;
            self.storage.resize(grown, 0);
        } else {
            // Slide the readable region down to offset zero.
            self.storage.copy_within(self.read_idx..self.write_idx, 0);
            self.write_idx -= self.front_size();
            self.read_idx = 0;
        }
    }

    /// Copy `data` in and advance the write cursor.
    pub fn write(&mut self, data: &[u8]) {
        self.stage(data);
        self.advance_write(data.len());
    }

    /// Copy `data` in without advancing the write cursor. The bytes are
    /// not readable until a subsequent `write` covers them.
    pub fn stage(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
    }

    /// Copy up to `dst.len()` readable bytes into `dst` without consuming
    /// them. Returns the number of bytes copied.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = cmp::min(dst.len(), self.readable_size());
        dst[..n].copy_from_slice(&self.storage[self.read_idx..self.read_idx + n]);
        n
    }

    /// Copy up to `dst.len()` readable bytes into `dst` and consume them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.advance_read(n);
        n
    }

    /// Consume `len` readable bytes without copying them anywhere.
    pub fn advance(&mut self, len: usize) {
        self.advance_read(len);
    }

    /// String copy of the next `len` readable bytes, without consuming.
    /// Empty when fewer than `len` bytes are readable.
    pub fn peek_string(&self, len: usize) -> String {
        if len > self.readable_size() {
            return String::new();
        }
        String::from_utf8_lossy(&self.storage[self.read_idx..self.read_idx + len]).into_owned()
    }

    /// String copy of the next `len` readable bytes, consuming them.
    pub fn read_string(&mut self, len: usize) -> String {
        let s = self.peek_string(len);
        if len <= self.readable_size() {
            self.advance_read(len);
        }
        s
    }

    fn find_lf(&self) -> Option<usize> {
        self.readable().iter().position(|&b| b == b'\n')
    }

    /// The readable bytes up to and including the first line feed, or
    /// `None` when the readable region holds no complete line. A carriage
    /// return, if present, stays in the returned slice.
    pub fn peek_line(&self) -> Option<&[u8]> {
        self.find_lf()
            .map(|pos| &self.storage[self.read_idx..self.read_idx + pos + 1])
    }

    /// Like `peek_line`, but consumes the returned line.
    pub fn read_line(&mut self) -> Option<String> {
        let len = self.find_lf()? + 1;
        Some(self.read_string(len))
    }

    /// Reset both cursors, discarding all readable bytes.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}
