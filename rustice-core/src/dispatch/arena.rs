use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Recycling arena for datagram decode buffers.
///
/// Buffer reuse lives here, not in any worker's control flow: a caller
/// checks a buffer out, fills it, and the buffer finds its own way back
/// when the last owner drops it. The arena never blocks: an empty
/// queue means a fresh allocation, a full queue means the returning
/// buffer simply deallocates.
#[derive(Clone)]
pub struct BufferArena {
    queue: Arc<ArrayQueue<BytesMut>>,
    buf_capacity: usize,
}

impl BufferArena {
    pub fn new(buffers: usize, buf_capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(buffers)),
            buf_capacity,
        }
    }
    pub fn checkout(&self) -> ArenaBuf {
        let data = match self.queue.pop() {
            Some(data) => data,
            None => BytesMut::with_capacity(self.buf_capacity),
        };
        ArenaBuf {
            queue: self.queue.clone(),
            buf_capacity: self.buf_capacity,
            data: ManuallyDrop::new(data),
        }
    }
    /// Buffers currently resting in the arena.
    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

/// Exclusively owned checkout from a [`BufferArena`].
pub struct ArenaBuf {
    queue: Arc<ArrayQueue<BytesMut>>,
    buf_capacity: usize,
    data: ManuallyDrop<BytesMut>,
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        let mut data = unsafe { ManuallyDrop::take(&mut self.data) };
        // A buffer that lost capacity to a split is not worth keeping.
        if data.capacity() >= self.buf_capacity {
            data.clear();
            let _ = self.queue.push(data);
        }
    }
}

impl Deref for ArenaBuf {
    type Target = BytesMut;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for ArenaBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}
