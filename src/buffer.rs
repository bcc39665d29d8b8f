//! Fixed-capacity byte buffer with independent read and write cursors.
//!
//! ```text
//!   0          read         write        capacity
//!   +-----------+-------------+------------+
//!   | consumed  |  readable   |  writable  |
//!   +-----------+-------------+------------+
//! ```
//!
//! Producers fill [`Buffer::write_slice`] directly (e.g. a socket `recv`) and then call
//! [`Buffer::advance_write`]; consumers drain [`Buffer::read_slice`] and call
//! [`Buffer::advance_read`]. The buffer never grows: when `can_write()` is false the
//! producer must stop, which is how backpressure reaches the socket.

/// Buffer is the staging area every connection reads into and writes out of
pub struct Buffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Buffer {
    /// new allocates a buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// readable returns how many bytes are waiting to be consumed
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// writable returns how many bytes can still be produced
    pub fn writable(&self) -> usize {
        self.data.len() - self.write
    }

    pub fn can_read(&self) -> bool {
        self.write > self.read
    }

    pub fn can_write(&self) -> bool {
        self.write < self.data.len()
    }

    /// write_slice exposes the writable region for the caller to fill
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    /// advance_write marks `n` bytes of the writable region as produced
    pub fn advance_write(&mut self, n: usize) {
        assert!(n <= self.writable(), "advance_write past writable region");
        self.write += n;
    }

    /// read_slice exposes the readable region for the caller to drain
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// advance_read marks `n` readable bytes as consumed, compacting once everything
    /// produced so far has been consumed
    pub fn advance_read(&mut self, n: usize) {
        assert!(n <= self.readable(), "advance_read past readable region");
        self.read += n;
        if self.read == self.write {
            self.reset();
        }
    }

    /// read_byte consumes a single byte
    pub fn read_byte(&mut self) -> Option<u8> {
        if !self.can_read() {
            return None;
        }

        let byte = self.data[self.read];
        self.advance_read(1);
        Some(byte)
    }

    /// write_byte produces a single byte, returning false when the buffer is full
    pub fn write_byte(&mut self, byte: u8) -> bool {
        if !self.can_write() {
            return false;
        }

        self.data[self.write] = byte;
        self.write += 1;
        true
    }

    /// write_all copies `bytes` in only if all of them fit
    pub fn write_all(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.writable() {
            return false;
        }

        self.data[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        true
    }

    /// compact moves unread bytes to the front to reclaim consumed space
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }

        self.data.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.read = 0;
    }

    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(buf: &Buffer) {
        assert!(buf.read <= buf.write);
        assert!(buf.write <= buf.capacity());
        assert_eq!(buf.can_read(), buf.write > buf.read);
        assert_eq!(buf.can_write(), buf.write < buf.capacity());
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = Buffer::new(8);
        assert!(!buf.can_read());
        assert!(buf.can_write());
        assert_eq!(buf.writable(), 8);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn test_cursor_invariants_hold_across_sequences() {
        let mut buf = Buffer::new(10);
        let steps: &[(usize, usize)] = &[(3, 1), (4, 6), (10, 2), (0, 8), (5, 0), (5, 5)];

        for &(w, r) in steps {
            let w = w.min(buf.writable());
            buf.write_slice()[..w].fill(0xAA);
            buf.advance_write(w);
            check_invariants(&buf);

            let r = r.min(buf.readable());
            buf.advance_read(r);
            check_invariants(&buf);
        }
    }

    #[test]
    fn test_full_buffer_stops_accepting_bytes() {
        let mut buf = Buffer::new(2);
        assert!(buf.write_byte(1));
        assert!(buf.write_byte(2));
        assert!(!buf.write_byte(3));
        assert!(!buf.can_write());
        assert_eq!(buf.read_slice(), &[1, 2]);
    }

    #[test]
    fn test_draining_compacts_cursors() {
        let mut buf = Buffer::new(4);
        assert!(buf.write_all(&[1, 2, 3, 4]));
        buf.advance_read(4);
        assert_eq!(buf.writable(), 4);
        assert!(!buf.can_read());
    }

    #[test]
    fn test_compact_preserves_unread_bytes() {
        let mut buf = Buffer::new(4);
        assert!(buf.write_all(&[1, 2, 3]));
        assert_eq!(buf.read_byte(), Some(1));
        buf.compact();
        assert_eq!(buf.read_slice(), &[2, 3]);
        assert_eq!(buf.writable(), 2);
    }

    #[test]
    fn test_write_all_rejects_oversized_input() {
        let mut buf = Buffer::new(3);
        assert!(!buf.write_all(&[0; 4]));
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    #[should_panic]
    fn test_advance_past_readable_panics() {
        let mut buf = Buffer::new(4);
        buf.advance_write(1);
        buf.advance_read(2);
    }
}
