//! Buffer set for socket I/O.

/// Read and write buffers of one connection.
///
/// Both buffers carry a cursor: bytes before `read_pos` were already
/// parsed, bytes before `write_pos` were already accepted by the socket.
#[derive(Debug)]
pub struct BufferSet {
    /// Bytes received from the server
    pub read_buffer: Vec<u8>,
    /// Start of the first unparsed message in `read_buffer`
    pub read_pos: usize,
    /// Outgoing messages
    pub write_buffer: Vec<u8>,
    /// Start of the unsent tail of `write_buffer`
    pub write_pos: usize,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            read_pos: 0,
            write_buffer: Vec::with_capacity(8192),
            write_pos: 0,
        }
    }

    /// Drop parsed bytes from the front of the read buffer.
    pub fn compact(&mut self) {
        if self.read_pos >= self.read_buffer.len() {
            self.read_buffer.clear();
        } else if self.read_pos > 0 {
            self.read_buffer.drain(..self.read_pos);
        }
        self.read_pos = 0;
    }

    /// True while written bytes wait for the socket.
    pub fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buffer.len()
    }

    /// Reset both buffers, keeping their capacity.
    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.read_pos = 0;
        self.write_buffer.clear();
        self.write_pos = 0;
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_keeps_unparsed_tail() {
        let mut set = BufferSet::new();
        set.read_buffer.extend_from_slice(b"abcdef");
        set.read_pos = 4;
        set.compact();
        assert_eq!(set.read_buffer, b"ef");
        assert_eq!(set.read_pos, 0);

        set.read_pos = 2;
        set.compact();
        assert!(set.read_buffer.is_empty());
    }
}
