// ABOUTME: Reusable send-buffer pool backing the engine's frame composition
// ABOUTME: Bounded free list; buffers are cleared on free and recycled on allocate

use crate::engine::traits::BufferPool;
use bytes::BytesMut;
use std::sync::Mutex;

/// Default capacity of a pooled send buffer. Control frames are tiny; payload
/// frames grow the buffer on demand and the grown buffer is recycled.
const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;

/// Default bound on retained free buffers.
const DEFAULT_MAX_POOLED: usize = 32;

/// A bounded free-list buffer pool.
///
/// `allocate` hands out a cleared buffer, reusing a freed one when available.
/// `free` retains up to `max_pooled` buffers and drops the rest.
pub struct VecPool {
    buffer_capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl VecPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> VecPool {
        VecPool {
            buffer_capacity,
            max_pooled,
            free: Mutex::new(Vec::new()),
        }
    }
}

impl Default for VecPool {
    fn default() -> VecPool {
        VecPool::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_POOLED)
    }
}

impl BufferPool for VecPool {
    fn allocate(&self) -> BytesMut {
        match self.free.lock().unwrap().pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.buffer_capacity),
        }
    }

    fn free(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn freed_buffer_is_reused() {
        let pool = VecPool::new(64, 4);

        let mut buf = pool.allocate();
        buf.put_slice(b"junk");
        let ptr = buf.as_ptr();
        pool.free(buf);

        let buf = pool.allocate();
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.is_empty());
    }

    #[test]
    fn pool_retention_is_bounded() {
        let pool = VecPool::new(64, 2);

        let a = pool.allocate();
        let b = pool.allocate();
        let c = pool.allocate();
        pool.free(a);
        pool.free(b);
        pool.free(c);

        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }

    #[test]
    fn allocate_without_free_list_creates_buffer() {
        let pool = VecPool::new(16, 4);
        let buf = pool.allocate();
        assert!(buf.capacity() >= 16);
    }
}
