//! Block buffer pool.
//!
//! Adapted from the teacher's `allocator/buffer.rs` idiom — a boxed slice
//! returned to a channel on drop — simplified to fixed-size single buffers
//! since cache blocks are always one 4 MiB unit, not a scatter-gather chain.

use tokio::sync::mpsc;

pub struct Buffer {
    data: Box<[u8]>,
    returner: mpsc::Sender<Box<[u8]>>,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::replace(&mut self.data, Box::new([]));
        let _ = self.returner.try_send(data);
    }
}

/// Bounded pool of zeroed `block_size` buffers. Allocation blocks (awaits)
/// when the pool is exhausted — the memory-bounded suspension point named
/// in spec §5.
pub struct BlockPool {
    block_size: usize,
    sender: mpsc::Sender<Box<[u8]>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Box<[u8]>>>,
}

impl BlockPool {
    pub fn new(block_size: usize, count: usize) -> Self {
        let (sender, receiver) = mpsc::channel(count.max(1));
        for _ in 0..count {
            let _ = sender.try_send(vec![0u8; block_size].into_boxed_slice());
        }
        BlockPool { block_size, sender, receiver: tokio::sync::Mutex::new(receiver) }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub async fn alloc(&self) -> Buffer {
        let data = self.receiver.lock().await.recv().await.expect("pool channel not to be closed");
        Buffer { data, returner: self.sender.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_returns_zeroed_buffer_of_block_size() {
        let pool = BlockPool::new(16, 2);
        let buf = pool.alloc().await;
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn dropped_buffer_is_recycled() {
        let pool = BlockPool::new(16, 1);
        {
            let _buf = pool.alloc().await;
        }
        let _buf2 = tokio::time::timeout(std::time::Duration::from_secs(1), pool.alloc())
            .await
            .expect("buffer should have been returned to the pool");
    }
}
