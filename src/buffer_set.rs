//! Buffer set shared between state machines and the I/O driver.

/// Read/write buffers for one connection.
///
/// State machines fill `write_buffer` and consume `read_buffer`; the
/// driver performs the actual I/O. The read side holds exactly one
/// message at a time.
pub struct BufferSet {
    /// Payload of the last message read (length field stripped)
    pub read_buffer: Vec<u8>,
    /// Outgoing bytes assembled by a state machine
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(1024),
            type_byte: 0,
        }
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
