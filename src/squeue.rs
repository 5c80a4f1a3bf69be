//! FIFO byte queue between the TLS layer and the frame decoder.
//!
//! The TLS reader appends whatever the socket yields; the decoder pops typed
//! values once enough bytes are buffered. Partial content is the normal case,
//! so every pop is checked against `len()` and returns `None` rather than
//! committing half a value.

use bytes::{Buf, BytesMut};

#[derive(Debug, Default)]
pub struct SQueue {
    buf: BytesMut,
}

impl SQueue {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn pop_u8(&mut self) -> Option<u8> {
        if self.buf.len() < 1 {
            return None;
        }
        Some(self.buf.get_u8())
    }

    /// Big-endian, like everything on the wire.
    pub fn pop_u16(&mut self) -> Option<u16> {
        if self.buf.len() < 2 {
            return None;
        }
        Some(self.buf.get_u16())
    }

    pub fn pop_u32(&mut self) -> Option<u32> {
        if self.buf.len() < 4 {
            return None;
        }
        Some(self.buf.get_u32())
    }

    pub fn pop_bytes(&mut self, n: usize) -> Option<BytesMut> {
        if self.buf.len() < n {
            return None;
        }
        Some(self.buf.split_to(n))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
