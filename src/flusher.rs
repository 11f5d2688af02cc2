//! Flusher (spec §2.L, §4.11).
//!
//! Periodic sweep that finalizes cache entries idling in `Uploading` state,
//! driving `IncrementalWriteStore::complete_incremental_write`. Modeled on
//! the teacher's spawned-task style (`vfs_task.rs`): one long-lived task
//! ticking on a `tokio::time::interval`, fanning eligible ids out to
//! concurrent per-id tasks and awaiting them all before the next tick.

use crate::cache::{Cache, State};
use crate::store::{ContentId, IncrementalWriteStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs the sweep loop until `shutdown` resolves, performing one final sweep
/// before returning (spec §5 cancellation: "Flusher ... performs one final
/// sweep").
pub async fn run(
    cache: Arc<Cache>,
    store: Arc<dyn IncrementalWriteStore>,
    sweep_interval: Duration,
    flush_timeout: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&cache, &store, flush_timeout).await;
            }
            _ = &mut shutdown => {
                info!("flusher shutting down, running final sweep");
                sweep_once(&cache, &store, flush_timeout).await;
                return;
            }
        }
    }
}

/// One sweep (spec §4.11 steps 1-4): collects eligible ids, spawns one task
/// per id, and waits for all of them before returning.
pub async fn sweep_once(cache: &Arc<Cache>, store: &Arc<dyn IncrementalWriteStore>, flush_timeout: Duration) {
    let threshold = Instant::now().checked_sub(flush_timeout).unwrap_or_else(Instant::now);
    let mut eligible = Vec::new();
    for id in cache.list().await {
        if is_eligible(cache, &**store, id, threshold).await {
            eligible.push(id);
        }
    }
    if eligible.is_empty() {
        return;
    }
    debug!(count = eligible.len(), "flusher sweep found eligible entries");

    let mut tasks = Vec::with_capacity(eligible.len());
    for id in eligible {
        let cache = cache.clone();
        let store = store.clone();
        tasks.push(tokio::spawn(async move { complete_one(&cache, &*store, id).await }));
    }
    let mut completed = 0usize;
    for task in tasks {
        if let Ok(true) = task.await {
            completed += 1;
        }
    }
    info!(completed, "flusher sweep finished");
}

async fn is_eligible(cache: &Cache, store: &dyn IncrementalWriteStore, id: ContentId, threshold: Instant) -> bool {
    if cache.get_state(id).await != State::Uploading {
        return false;
    }
    if cache.last_write(id).await >= threshold {
        return false;
    }
    match store.get_incremental_write_state(id).await {
        Ok(Some(write_state)) => write_state.parts_writing == 0,
        // Not an incremental-write-capable id (or store has no record yet):
        // fall back to the flushed-offset-equals-size rule (spec §4.11 step 2).
        Ok(None) => cache.get_flushed_offset(id).await == cache.size(id).await,
        Err(_) => false,
    }
}

/// Finalizes one id; returns whether it transitioned to `Cached`.
async fn complete_one(cache: &Cache, store: &dyn IncrementalWriteStore, id: ContentId) -> bool {
    match store.complete_incremental_write(id, cache).await {
        Ok(()) => {
            cache.set_state(id, State::Cached).await;
            true
        }
        Err(err) => {
            warn!(?err, "flusher failed to complete incremental write, leaving state for retry");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Attr, DirEntry, FileType, IncrementalWriteState, MetadataStore, NodeId, SetAttr, StoreError, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeStore {
        parts_writing: AtomicU32,
        completed: Mutex<Vec<ContentId>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl FakeStore {
        fn new(parts_writing: u32) -> Self {
            FakeStore {
                parts_writing: AtomicU32::new(parts_writing),
                completed: Mutex::new(Vec::new()),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MetadataStore for FakeStore {
        async fn lookup(&self, _dir: NodeId, _name: &str) -> StoreResult<NodeId> {
            Err(StoreError::NotFound)
        }
        async fn create_file(&self, _dir: NodeId, _name: &str, _mode: u32) -> StoreResult<NodeId> {
            Err(StoreError::NotFound)
        }
        async fn create_dir(&self, _dir: NodeId, _name: &str, _mode: u32) -> StoreResult<NodeId> {
            Err(StoreError::NotFound)
        }
        async fn remove(&self, _dir: NodeId, _name: &str) -> StoreResult<()> {
            Err(StoreError::NotFound)
        }
        async fn rename(&self, _sd: NodeId, _sn: &str, _dd: NodeId, _dn: &str) -> StoreResult<()> {
            Err(StoreError::NotFound)
        }
        async fn link(&self, _dir: NodeId, _name: &str, _target: NodeId) -> StoreResult<()> {
            Err(StoreError::NotFound)
        }
        async fn get_attr(&self, _node: NodeId) -> StoreResult<Attr> {
            Err(StoreError::NotFound)
        }
        async fn set_attr(&self, _node: NodeId, _attr: SetAttr) -> StoreResult<Attr> {
            Err(StoreError::NotFound)
        }
        async fn read_dir(&self, _dir: NodeId, _cookie: u64, _verifier: u64) -> StoreResult<(Vec<DirEntry>, u64, bool)> {
            Ok((Vec::new(), 0, true))
        }
        async fn content_id_of(&self, _node: NodeId) -> StoreResult<ContentId> {
            Err(StoreError::NotFound)
        }
    }

    #[async_trait]
    impl crate::store::ContentStore for FakeStore {
        async fn read_at(&self, _id: ContentId, _buf: &mut [u8], _offset: u64) -> StoreResult<usize> {
            Ok(0)
        }
        async fn get_content_size(&self, _id: ContentId) -> StoreResult<u64> {
            Ok(0)
        }
        async fn content_exists(&self, _id: ContentId) -> StoreResult<bool> {
            Ok(true)
        }
        async fn write_at(&self, _id: ContentId, _data: &[u8], _offset: u64) -> StoreResult<()> {
            Ok(())
        }
        async fn truncate(&self, _id: ContentId, _size: u64) -> StoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _id: ContentId) -> StoreResult<()> {
            Ok(())
        }
        async fn write_content(&self, _id: ContentId, _bytes: &[u8]) -> StoreResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl IncrementalWriteStore for FakeStore {
        async fn begin_incremental_write(&self, _id: ContentId) -> StoreResult<u64> {
            Ok(1)
        }
        async fn flush_incremental(&self, _id: ContentId, _cache: &Cache) -> StoreResult<u64> {
            Ok(0)
        }
        async fn complete_incremental_write(&self, id: ContentId, _cache: &Cache) -> StoreResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Io);
            }
            self.completed.lock().unwrap().push(id);
            Ok(())
        }
        async fn abort_incremental_write(&self, _id: ContentId) -> StoreResult<()> {
            Ok(())
        }
        async fn get_incremental_write_state(&self, _id: ContentId) -> StoreResult<Option<IncrementalWriteState>> {
            Ok(Some(IncrementalWriteState {
                upload_id: 1,
                parts_written: 1,
                parts_writing: self.parts_writing.load(Ordering::SeqCst),
                total_flushed: 0,
            }))
        }
    }

    #[tokio::test]
    async fn idle_uploading_entry_is_finalized() {
        let cache = Arc::new(Cache::new(64, 16, 4));
        let id = ContentId(1);
        cache.write_at(id, 0, b"data").await;
        cache.set_state(id, State::Uploading).await;
        let store: Arc<dyn IncrementalWriteStore> = Arc::new(FakeStore::new(0));

        sweep_once(&cache, &store, Duration::from_secs(0)).await;
        assert_eq!(cache.get_state(id).await, State::Cached);
    }

    #[tokio::test]
    async fn entry_with_parts_still_writing_is_skipped() {
        let cache = Arc::new(Cache::new(64, 16, 4));
        let id = ContentId(1);
        cache.write_at(id, 0, b"data").await;
        cache.set_state(id, State::Uploading).await;
        let store: Arc<dyn IncrementalWriteStore> = Arc::new(FakeStore::new(1));

        sweep_once(&cache, &store, Duration::from_secs(0)).await;
        assert_eq!(cache.get_state(id).await, State::Uploading);
    }

    #[tokio::test]
    async fn recently_written_entry_is_not_yet_eligible() {
        let cache = Arc::new(Cache::new(64, 16, 4));
        let id = ContentId(1);
        cache.write_at(id, 0, b"data").await;
        cache.set_state(id, State::Uploading).await;
        let store: Arc<dyn IncrementalWriteStore> = Arc::new(FakeStore::new(0));

        sweep_once(&cache, &store, Duration::from_secs(3600)).await;
        assert_eq!(cache.get_state(id).await, State::Uploading);
    }

    #[tokio::test]
    async fn store_error_leaves_state_unchanged_for_retry() {
        let cache = Arc::new(Cache::new(64, 16, 4));
        let id = ContentId(1);
        cache.write_at(id, 0, b"data").await;
        cache.set_state(id, State::Uploading).await;
        let fake = FakeStore::new(0);
        fake.fail_next.store(true, Ordering::SeqCst);
        let store: Arc<dyn IncrementalWriteStore> = Arc::new(fake);

        sweep_once(&cache, &store, Duration::from_secs(0)).await;
        assert_eq!(cache.get_state(id).await, State::Uploading);
    }
}
