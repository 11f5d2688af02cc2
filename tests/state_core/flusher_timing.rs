//! Flusher idle-detection sweep (spec §4.11) driving the in-memory demo
//! store's incremental-write path end to end.

use super::common::Fixture;
use dittofs_core::cache::State as CacheState;
use dittofs_core::flusher;
use dittofs_core::store::{ContentStore, IncrementalWriteStore, MetadataStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn idle_uploading_file_is_drained_into_the_store() {
    let fx = Fixture::new();
    let node = fx.store.create_file(super::common::memstore::ROOT, "upload.bin", 0o644).await.unwrap();
    let content_id = fx.store.content_id_of(node).await.unwrap();

    fx.cache.write_at(content_id, 0, b"incremental upload payload").await;
    fx.cache.set_state(content_id, CacheState::Uploading).await;
    fx.store.begin_incremental_write(content_id).await.unwrap();

    let incremental_store: Arc<dyn IncrementalWriteStore> = fx.store.clone();
    flusher::sweep_once(&fx.cache, &incremental_store, Duration::from_secs(0)).await;

    assert_eq!(fx.cache.get_state(content_id).await, CacheState::Cached);
    assert_eq!(fx.store.get_content_size(content_id).await.unwrap(), 26);
    assert!(fx.store.get_incremental_write_state(content_id).await.unwrap().is_none());
}

#[tokio::test]
async fn recently_written_file_is_skipped_by_the_sweep() {
    let fx = Fixture::new();
    let node = fx.store.create_file(super::common::memstore::ROOT, "still-writing.bin", 0o644).await.unwrap();
    let content_id = fx.store.content_id_of(node).await.unwrap();

    fx.cache.write_at(content_id, 0, b"fresh bytes").await;
    fx.cache.set_state(content_id, CacheState::Uploading).await;
    fx.store.begin_incremental_write(content_id).await.unwrap();

    let incremental_store: Arc<dyn IncrementalWriteStore> = fx.store.clone();
    flusher::sweep_once(&fx.cache, &incremental_store, Duration::from_secs(3600)).await;

    assert_eq!(fx.cache.get_state(content_id).await, CacheState::Uploading);
}
