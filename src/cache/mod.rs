//! Write-path Cache (spec §2.K, §3.8, §4.10).
//!
//! A payload is split into 64 MiB chunks, each split into 4 MiB blocks. Each
//! block tracks which byte ranges within it have been written via a sorted
//! run list rather than a per-byte bitmap (spec §9 permits either
//! representation; a run list is far cheaper for the mostly-contiguous
//! write patterns this cache sees).

pub mod pool;

use crate::store::ContentId;
use pool::{BlockPool, Buffer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    None,
    Buffering,
    Uploading,
    Cached,
    Prefetching,
}

struct Block {
    buffer: Option<Buffer>,
    covered: Vec<(u32, u32)>,
}

impl Block {
    fn new() -> Self {
        Block { buffer: None, covered: Vec::new() }
    }

    fn mark_covered(&mut self, start: u32, end: u32) {
        self.covered.push((start, end));
        self.covered.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.covered.len());
        for (s, e) in self.covered.drain(..) {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.covered = merged;
    }

    fn is_fully_covered(&self, block_size: u32) -> bool {
        self.covered.len() == 1 && self.covered[0] == (0, block_size)
    }

    fn is_range_covered(&self, start: u32, end: u32) -> bool {
        self.covered.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Copies covered bytes within `[start, end)` into `dest`, leaving
    /// uncovered positions untouched (sparse read semantics, spec §4.10).
    fn copy_into(&self, start: u32, end: u32, dest: &mut [u8]) -> bool {
        let Some(buffer) = &self.buffer else { return false };
        let mut copied_any = false;
        for &(cs, ce) in &self.covered {
            let lo = cs.max(start);
            let hi = ce.min(end);
            if lo < hi {
                let dest_off = (lo - start) as usize;
                let len = (hi - lo) as usize;
                dest[dest_off..dest_off + len].copy_from_slice(&buffer[lo as usize..hi as usize]);
                copied_any = true;
            }
        }
        copied_any
    }
}

struct Chunk {
    blocks: HashMap<u32, Block>,
}

impl Chunk {
    fn new() -> Self {
        Chunk { blocks: HashMap::new() }
    }
}

struct Entry {
    chunks: HashMap<u32, Chunk>,
    state: State,
    last_write: Instant,
    flushed_offset: u64,
    size: u64,
}

impl Entry {
    fn new() -> Self {
        Entry { chunks: HashMap::new(), state: State::None, last_write: Instant::now(), flushed_offset: 0, size: 0 }
    }
}

struct EntryHandle {
    inner: Mutex<Entry>,
}

pub struct Cache {
    entries: tokio::sync::RwLock<HashMap<ContentId, Arc<EntryHandle>>>,
    pool: BlockPool,
    chunk_size: u64,
    block_size: u64,
}

impl Cache {
    pub fn new(chunk_size: u64, block_size: u64, pool_blocks: usize) -> Self {
        Cache {
            entries: tokio::sync::RwLock::new(HashMap::new()),
            pool: BlockPool::new(block_size as usize, pool_blocks),
            chunk_size,
            block_size,
        }
    }

    async fn entry_handle(&self, id: ContentId) -> Arc<EntryHandle> {
        if let Some(h) = self.entries.read().await.get(&id) {
            return h.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(id)
            .or_insert_with(|| Arc::new(EntryHandle { inner: Mutex::new(Entry::new()) }))
            .clone()
    }

    fn locate(&self, offset: u64) -> (u32, u32, u32) {
        let chunk_idx = (offset / self.chunk_size) as u32;
        let offset_in_chunk = offset % self.chunk_size;
        let block_idx = (offset_in_chunk / self.block_size) as u32;
        let offset_in_block = (offset_in_chunk % self.block_size) as u32;
        (chunk_idx, block_idx, offset_in_block)
    }

    /// `write_at` (spec §4.10): allocates block buffers as needed (the
    /// suspension point named in spec §5 — block allocation may await the
    /// pool), then mutates coverage under the per-entry `std::sync::Mutex`
    /// with no further `.await`.
    pub async fn write_at(&self, id: ContentId, offset: u64, data: &[u8]) {
        let handle = self.entry_handle(id).await;
        let block_size = self.block_size as u32;

        let mut pos = 0usize;
        let mut cur_offset = offset;
        while pos < data.len() {
            let (chunk_idx, block_idx, offset_in_block) = self.locate(cur_offset);
            let space_in_block = (block_size - offset_in_block) as usize;
            let take = space_in_block.min(data.len() - pos);

            let needs_alloc = {
                let entry = handle.inner.lock().unwrap();
                entry
                    .chunks
                    .get(&chunk_idx)
                    .and_then(|c| c.blocks.get(&block_idx))
                    .map(|b| b.buffer.is_none())
                    .unwrap_or(true)
            };
            let fresh_buffer = if needs_alloc { Some(self.pool.alloc().await) } else { None };

            {
                let mut entry = handle.inner.lock().unwrap();
                let chunk = entry.chunks.entry(chunk_idx).or_insert_with(Chunk::new);
                let block = chunk.blocks.entry(block_idx).or_insert_with(Block::new);
                if block.buffer.is_none() {
                    block.buffer = fresh_buffer;
                }
                if let Some(buf) = &mut block.buffer {
                    buf[offset_in_block as usize..offset_in_block as usize + take]
                        .copy_from_slice(&data[pos..pos + take]);
                }
                block.mark_covered(offset_in_block, offset_in_block + take as u32);
                if entry.state == State::None {
                    entry.state = State::Buffering;
                }
                entry.last_write = Instant::now();
                entry.size = entry.size.max(cur_offset + take as u64);
            }

            pos += take;
            cur_offset += take as u64;
        }
    }

    /// `read` (spec §4.10): returns `(found_any, fully_covered)`.
    pub async fn read(&self, id: ContentId, offset: u64, dest: &mut [u8]) -> (bool, bool) {
        let handle = self.entry_handle(id).await;
        let block_size = self.block_size as u32;
        let entry = handle.inner.lock().unwrap();

        let mut found_any = false;
        let mut fully_covered = true;
        let mut pos = 0usize;
        let mut cur_offset = offset;
        while pos < dest.len() {
            let (chunk_idx, block_idx, offset_in_block) = self.locate(cur_offset);
            let space_in_block = (block_size - offset_in_block) as usize;
            let take = space_in_block.min(dest.len() - pos);
            let end = offset_in_block + take as u32;

            match entry.chunks.get(&chunk_idx).and_then(|c| c.blocks.get(&block_idx)) {
                Some(block) => {
                    if block.copy_into(offset_in_block, end, &mut dest[pos..pos + take]) {
                        found_any = true;
                    }
                    if !block.is_range_covered(offset_in_block, end) {
                        fully_covered = false;
                    }
                }
                None => fully_covered = false,
            }

            pos += take;
            cur_offset += take as u64;
        }
        (found_any, fully_covered)
    }

    pub async fn is_block_fully_covered(&self, id: ContentId, chunk_idx: u32, block_idx: u32) -> bool {
        let handle = self.entry_handle(id).await;
        let entry = handle.inner.lock().unwrap();
        let block_size = self.block_size as u32;
        entry
            .chunks
            .get(&chunk_idx)
            .and_then(|c| c.blocks.get(&block_idx))
            .map(|b| b.is_fully_covered(block_size))
            .unwrap_or(false)
    }

    pub async fn is_range_covered(&self, id: ContentId, offset: u64, length: u64) -> bool {
        let mut buf = vec![0u8; length as usize];
        let (_, fully_covered) = self.read(id, offset, &mut buf).await;
        fully_covered
    }

    pub async fn set_state(&self, id: ContentId, state: State) {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().state = state;
    }

    pub async fn get_state(&self, id: ContentId) -> State {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().state
    }

    pub async fn last_write(&self, id: ContentId) -> Instant {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().last_write
    }

    pub async fn size(&self, id: ContentId) -> u64 {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().size
    }

    pub async fn get_flushed_offset(&self, id: ContentId) -> u64 {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().flushed_offset
    }

    pub async fn set_flushed_offset(&self, id: ContentId, offset: u64) {
        let handle = self.entry_handle(id).await;
        handle.inner.lock().unwrap().flushed_offset = offset;
    }

    pub async fn list(&self) -> Vec<ContentId> {
        self.entries.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_returns_zeros_for_uncovered_bytes() {
        let cache = Cache::new(64, 16, 4);
        let id = ContentId(1);
        cache.write_at(id, 4, b"XXXX").await;
        let mut dest = vec![0u8; 16];
        let (found, fully) = cache.read(id, 0, &mut dest).await;
        assert!(found);
        assert!(!fully);
        assert_eq!(&dest[0..4], &[0, 0, 0, 0]);
        assert_eq!(&dest[4..8], b"XXXX");
    }

    #[tokio::test]
    async fn fully_covered_block_is_eager_upload_eligible() {
        let cache = Cache::new(64, 16, 4);
        let id = ContentId(1);
        cache.write_at(id, 0, &[1u8; 16]).await;
        assert!(cache.is_block_fully_covered(id, 0, 0).await);
    }

    #[tokio::test]
    async fn write_then_read_equivalence_across_block_boundary() {
        let cache = Cache::new(64, 16, 8);
        let id = ContentId(1);
        let data: Vec<u8> = (0..40u8).collect();
        cache.write_at(id, 0, &data).await;
        let mut dest = vec![0u8; 40];
        let (_, fully) = cache.read(id, 0, &mut dest).await;
        assert!(fully);
        assert_eq!(dest, data);
    }

    #[tokio::test]
    async fn state_transitions_are_explicit() {
        let cache = Cache::new(64, 16, 4);
        let id = ContentId(1);
        assert_eq!(cache.get_state(id).await, State::None);
        cache.write_at(id, 0, b"x").await;
        assert_eq!(cache.get_state(id).await, State::Buffering);
        cache.set_state(id, State::Uploading).await;
        assert_eq!(cache.get_state(id).await, State::Uploading);
        cache.set_state(id, State::Cached).await;
        assert_eq!(cache.get_state(id).await, State::Cached);
    }
}
