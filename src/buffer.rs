use bytes::BytesMut;
use std::sync::Mutex;

/// Pool of read buffers with single-owner semantics: `acquire` moves a buffer
/// out, `release` moves it back. Nothing here is reference counted; a buffer
/// that is never returned is simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_capacity,
            max_pooled,
        }
    }

    /// Take a cleared buffer out of the pool, allocating when empty.
    pub fn acquire(&self) -> BytesMut {
        self.buffers
            .lock()
            .expect("buffer pool lock")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Return a buffer. Shrunken buffers (split off into frames that kept
    /// their payload) and overflow beyond `max_pooled` are dropped.
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_capacity {
            return;
        }
        let mut buffers = self.buffers.lock().expect("buffer pool lock");
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        // one full frame plus header comfortably fits
        Self::new(32 * 1024, 8)
    }
}
