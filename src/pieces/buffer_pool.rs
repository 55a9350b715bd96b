use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Pool of reusable buffers for standard-length pieces. Odd-sized pieces
/// (the last one) bypass the pool entirely.
#[derive(Debug)]
pub struct PieceBufferPool {
    buffer_len: usize,
    max_buffers: usize,
    buffers: VecDeque<BytesMut>,
}

impl PieceBufferPool {
    pub fn new(buffer_len: usize, max_buffers: usize) -> Self {
        Self {
            buffer_len,
            max_buffers,
            buffers: VecDeque::new(),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Take a pooled buffer. `None` means the caller allocates a fresh one.
    pub fn acquire(&mut self) -> Option<BytesMut> {
        self.buffers.pop_front()
    }

    /// Best-effort return of a frozen piece buffer. Succeeds only when the
    /// caller held the last reference, the size matches and the pool has
    /// room; otherwise the memory is simply dropped.
    pub fn release(&mut self, bytes: Bytes) {
        if self.buffers.len() >= self.max_buffers {
            return;
        }
        let Ok(mut buffer) = bytes.try_into_mut() else {
            return;
        };
        if buffer.capacity() < self.buffer_len {
            return;
        }
        buffer.clear();
        self.buffers.push_back(buffer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
