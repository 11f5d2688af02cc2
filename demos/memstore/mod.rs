//! In-memory `MetadataStore`/`ContentStore`/`IncrementalWriteStore`
//! (spec §6.6). Styled on the teacher's `InMemoryVfs`
//! (`examples/in_memory/filesystem.rs`): a `State` struct under one
//! `tokio::sync::RwLock`, a `nodes` map, and a default-attribute helper.
//! Exists to give the cache, flusher, and dispatcher something real to
//! drive in tests; it is not a production backend (spec §1 Non-goals).

use async_trait::async_trait;
use dittofs_core::cache::Cache;
use dittofs_core::store::{
    Attr, ContentId, ContentStore, DirEntry, FileType, IncrementalWriteState, IncrementalWriteStore,
    MetadataStore, NodeId, SetAttr, StoreError, StoreResult,
};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tokio::sync::RwLock;

pub const ROOT: NodeId = NodeId(1);

struct NodeRecord {
    attr: Attr,
    /// `Some` only for directories; name -> child node id, ordered for
    /// stable `read_dir` cookies.
    children: Option<BTreeMap<String, NodeId>>,
}

struct Incremental {
    upload_id: u64,
    parts_written: u32,
}

struct State {
    nodes: HashMap<NodeId, NodeRecord>,
    contents: HashMap<ContentId, Vec<u8>>,
    incremental: HashMap<ContentId, Incremental>,
    next_node_id: u64,
    next_content_id: u64,
    next_upload_id: u64,
}

impl State {
    fn new() -> Self {
        let mut state = State {
            nodes: HashMap::new(),
            contents: HashMap::new(),
            incremental: HashMap::new(),
            next_node_id: 2,
            next_content_id: 1,
            next_upload_id: 1,
        };
        state.nodes.insert(ROOT, NodeRecord { attr: default_attr(FileType::Directory, ContentId(0)), children: Some(BTreeMap::new()) });
        state
    }

    fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    fn alloc_content(&mut self) -> ContentId {
        let id = ContentId(self.next_content_id);
        self.next_content_id += 1;
        id
    }

    fn dir_children(&self, dir: NodeId) -> StoreResult<&BTreeMap<String, NodeId>> {
        match self.nodes.get(&dir) {
            Some(record) => record.children.as_ref().ok_or(StoreError::NotDir),
            None => Err(StoreError::NotFound),
        }
    }

    fn dir_children_mut(&mut self, dir: NodeId) -> StoreResult<&mut BTreeMap<String, NodeId>> {
        match self.nodes.get_mut(&dir) {
            Some(record) => record.children.as_mut().ok_or(StoreError::NotDir),
            None => Err(StoreError::NotFound),
        }
    }

    fn touch_mtime(&mut self, node: NodeId) {
        if let Some(record) = self.nodes.get_mut(&node) {
            record.attr.mtime = now();
        }
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

fn default_attr(file_type: FileType, content_id: ContentId) -> Attr {
    let ts = now();
    Attr {
        file_type,
        size: 0,
        mode: match file_type {
            FileType::Directory => 0o755,
            _ => 0o644,
        },
        uid: 0,
        gid: 0,
        mtime: ts,
        ctime: ts,
        atime: ts,
        content_id,
    }
}

/// Directory-mutation verifier for `read_dir`'s cookie staleness check: the
/// directory's own `mtime`, so any create/remove/rename invalidates
/// outstanding cookies (spec §6.2).
fn dir_verifier(attr: &Attr) -> u64 {
    attr.mtime.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

pub struct MemStore {
    state: RwLock<State>,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore { state: RwLock::new(State::new()) }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemStore {
    async fn lookup(&self, dir: NodeId, name: &str) -> StoreResult<NodeId> {
        let state = self.state.read().await;
        state.dir_children(dir)?.get(name).copied().ok_or(StoreError::NotFound)
    }

    async fn create_file(&self, dir: NodeId, name: &str, mode: u32) -> StoreResult<NodeId> {
        let mut state = self.state.write().await;
        if state.dir_children(dir)?.contains_key(name) {
            return Err(StoreError::Exists);
        }
        let content_id = state.alloc_content();
        state.contents.insert(content_id, Vec::new());
        let node_id = state.alloc_node();
        let mut attr = default_attr(FileType::File, content_id);
        attr.mode = mode;
        state.nodes.insert(node_id, NodeRecord { attr, children: None });
        state.dir_children_mut(dir)?.insert(name.to_string(), node_id);
        state.touch_mtime(dir);
        Ok(node_id)
    }

    async fn create_dir(&self, dir: NodeId, name: &str, mode: u32) -> StoreResult<NodeId> {
        let mut state = self.state.write().await;
        if state.dir_children(dir)?.contains_key(name) {
            return Err(StoreError::Exists);
        }
        let node_id = state.alloc_node();
        let mut attr = default_attr(FileType::Directory, ContentId(0));
        attr.mode = mode;
        state.nodes.insert(node_id, NodeRecord { attr, children: Some(BTreeMap::new()) });
        state.dir_children_mut(dir)?.insert(name.to_string(), node_id);
        state.touch_mtime(dir);
        Ok(node_id)
    }

    async fn remove(&self, dir: NodeId, name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let target = *state.dir_children(dir)?.get(name).ok_or(StoreError::NotFound)?;
        if let Some(record) = state.nodes.get(&target) {
            if let Some(children) = &record.children {
                if !children.is_empty() {
                    return Err(StoreError::NotEmpty);
                }
            }
        }
        state.dir_children_mut(dir)?.remove(name);
        // Other hard links (from `link`) may still reference `target`; it
        // stays in `nodes` until nothing points to it. This demo does not
        // track a link count, so a fully-unlinked node simply becomes
        // unreachable rather than being freed.
        state.touch_mtime(dir);
        Ok(())
    }

    async fn rename(&self, src_dir: NodeId, src_name: &str, dst_dir: NodeId, dst_name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let node = *state.dir_children(src_dir)?.get(src_name).ok_or(StoreError::NotFound)?;
        if state.dir_children(dst_dir)?.contains_key(dst_name) {
            return Err(StoreError::Exists);
        }
        state.dir_children_mut(src_dir)?.remove(src_name);
        state.dir_children_mut(dst_dir)?.insert(dst_name.to_string(), node);
        state.touch_mtime(src_dir);
        if dst_dir != src_dir {
            state.touch_mtime(dst_dir);
        }
        Ok(())
    }

    async fn link(&self, dir: NodeId, name: &str, target: NodeId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&target) {
            return Err(StoreError::NotFound);
        }
        if state.dir_children(dir)?.contains_key(name) {
            return Err(StoreError::Exists);
        }
        state.dir_children_mut(dir)?.insert(name.to_string(), target);
        state.touch_mtime(dir);
        Ok(())
    }

    async fn get_attr(&self, node: NodeId) -> StoreResult<Attr> {
        let state = self.state.read().await;
        state.nodes.get(&node).map(|r| r.attr).ok_or(StoreError::NotFound)
    }

    async fn set_attr(&self, node: NodeId, attr: SetAttr) -> StoreResult<Attr> {
        let mut state = self.state.write().await;
        let content_id = state.nodes.get(&node).ok_or(StoreError::NotFound)?.attr.content_id;
        if let Some(size) = attr.size {
            let bytes = state.contents.get_mut(&content_id).ok_or(StoreError::IsDir)?;
            bytes.resize(size as usize, 0);
        }
        let record = state.nodes.get_mut(&node).ok_or(StoreError::NotFound)?;
        if let Some(mode) = attr.mode {
            record.attr.mode = mode;
        }
        if let Some(uid) = attr.uid {
            record.attr.uid = uid;
        }
        if let Some(gid) = attr.gid {
            record.attr.gid = gid;
        }
        if let Some(size) = attr.size {
            record.attr.size = size;
        }
        if let Some(mtime) = attr.mtime {
            record.attr.mtime = mtime;
        }
        if let Some(atime) = attr.atime {
            record.attr.atime = atime;
        }
        record.attr.ctime = now();
        Ok(record.attr)
    }

    async fn read_dir(&self, dir: NodeId, cookie: u64, verifier: u64) -> StoreResult<(Vec<DirEntry>, u64, bool)> {
        let state = self.state.read().await;
        let attr = state.nodes.get(&dir).ok_or(StoreError::NotFound)?.attr;
        let current_verifier = dir_verifier(&attr);
        if cookie != 0 && verifier != current_verifier {
            return Err(StoreError::NotFound);
        }
        let children = state.dir_children(dir)?;
        let entries: Vec<DirEntry> = children
            .iter()
            .enumerate()
            .map(|(i, (name, node))| DirEntry { name: name.clone(), node: *node, cookie: (i + 1) as u64 })
            .skip(cookie as usize)
            .collect();
        Ok((entries, current_verifier, true))
    }

    async fn content_id_of(&self, node: NodeId) -> StoreResult<ContentId> {
        let state = self.state.read().await;
        let record = state.nodes.get(&node).ok_or(StoreError::NotFound)?;
        if record.children.is_some() {
            return Err(StoreError::IsDir);
        }
        Ok(record.attr.content_id)
    }
}

#[async_trait]
impl ContentStore for MemStore {
    async fn read_at(&self, id: ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize> {
        let state = self.state.read().await;
        let bytes = state.contents.get(&id).ok_or(StoreError::NotFound)?;
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let len = buf.len().min(bytes.len() - offset);
        buf[..len].copy_from_slice(&bytes[offset..offset + len]);
        Ok(len)
    }

    async fn get_content_size(&self, id: ContentId) -> StoreResult<u64> {
        let state = self.state.read().await;
        state.contents.get(&id).map(|b| b.len() as u64).ok_or(StoreError::NotFound)
    }

    async fn content_exists(&self, id: ContentId) -> StoreResult<bool> {
        Ok(self.state.read().await.contents.contains_key(&id))
    }

    async fn write_at(&self, id: ContentId, data: &[u8], offset: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let bytes = state.contents.get_mut(&id).ok_or(StoreError::NotFound)?;
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn truncate(&self, id: ContentId, size: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let bytes = state.contents.get_mut(&id).ok_or(StoreError::NotFound)?;
        bytes.resize(size as usize, 0);
        Ok(())
    }

    async fn delete(&self, id: ContentId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.contents.remove(&id).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn write_content(&self, id: ContentId, bytes: &[u8]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let slot = state.contents.get_mut(&id).ok_or(StoreError::NotFound)?;
        slot.clear();
        slot.extend_from_slice(bytes);
        Ok(())
    }
}

#[async_trait]
impl IncrementalWriteStore for MemStore {
    async fn begin_incremental_write(&self, id: ContentId) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        if !state.contents.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let upload_id = state.next_upload_id;
        state.next_upload_id += 1;
        state.incremental.insert(id, Incremental { upload_id, parts_written: 0 });
        Ok(upload_id)
    }

    /// Copies every cache byte from the content's current `flushed_offset`
    /// up to its tracked `size` into the backing store (spec §4.11's
    /// `IncrementalWriteStore` contract), advancing `flushed_offset`.
    async fn flush_incremental(&self, id: ContentId, cache: &Cache) -> StoreResult<u64> {
        let total_size = cache.size(id).await;
        let flushed = cache.get_flushed_offset(id).await;
        if flushed >= total_size {
            return Ok(0);
        }
        let len = (total_size - flushed) as usize;
        let mut buf = vec![0u8; len];
        cache.read(id, flushed, &mut buf).await;

        let mut state = self.state.write().await;
        let bytes = state.contents.get_mut(&id).ok_or(StoreError::NotFound)?;
        let end = flushed as usize + len;
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[flushed as usize..end].copy_from_slice(&buf);
        if let Some(tracking) = state.incremental.get_mut(&id) {
            tracking.parts_written += 1;
        }
        drop(state);
        cache.set_flushed_offset(id, total_size).await;
        Ok(len as u64)
    }

    async fn complete_incremental_write(&self, id: ContentId, cache: &Cache) -> StoreResult<()> {
        self.flush_incremental(id, cache).await?;
        self.state.write().await.incremental.remove(&id);
        Ok(())
    }

    async fn abort_incremental_write(&self, id: ContentId) -> StoreResult<()> {
        self.state.write().await.incremental.remove(&id);
        Ok(())
    }

    async fn get_incremental_write_state(&self, id: ContentId) -> StoreResult<Option<IncrementalWriteState>> {
        let state = self.state.read().await;
        Ok(state.incremental.get(&id).map(|t| IncrementalWriteState {
            upload_id: t.upload_id,
            parts_written: t.parts_written,
            parts_writing: 0,
            total_flushed: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_lookup_and_read_dir_round_trip() {
        let store = MemStore::new();
        let file = store.create_file(ROOT, "a.txt", 0o644).await.unwrap();
        assert_eq!(store.lookup(ROOT, "a.txt").await.unwrap(), file);

        let (entries, verifier, eof) = store.read_dir(ROOT, 0, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(eof);
        assert_eq!(store.read_dir(ROOT, 1, verifier).await.unwrap().0.len(), 0);
    }

    #[tokio::test]
    async fn remove_non_empty_directory_fails() {
        let store = MemStore::new();
        let dir = store.create_dir(ROOT, "d", 0o755).await.unwrap();
        store.create_file(dir, "x", 0o644).await.unwrap();
        assert_eq!(store.remove(ROOT, "d").await.unwrap_err(), StoreError::NotEmpty);
    }

    #[tokio::test]
    async fn write_read_and_truncate_content() {
        let store = MemStore::new();
        let file = store.create_file(ROOT, "f", 0o644).await.unwrap();
        let content_id = store.content_id_of(file).await.unwrap();
        store.write_at(content_id, b"hello", 0).await.unwrap();
        let mut buf = [0u8; 5];
        store.read_at(content_id, &mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"hello");
        store.truncate(content_id, 2).await.unwrap();
        assert_eq!(store.get_content_size(content_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incremental_write_drains_cache_into_content() {
        let store = MemStore::new();
        let file = store.create_file(ROOT, "big", 0o644).await.unwrap();
        let content_id = store.content_id_of(file).await.unwrap();
        store.begin_incremental_write(content_id).await.unwrap();

        let cache = Cache::new(64, 16, 4);
        cache.write_at(content_id, 0, b"0123456789").await;

        let uploaded = store.flush_incremental(content_id, &cache).await.unwrap();
        assert_eq!(uploaded, 10);
        store.complete_incremental_write(content_id, &cache).await.unwrap();
        assert_eq!(store.get_content_size(content_id).await.unwrap(), 10);
        assert!(store.get_incremental_write_state(content_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_cookie_after_mutation_is_rejected() {
        let store = MemStore::new();
        let (_, verifier, _) = store.read_dir(ROOT, 0, 0).await.unwrap();
        store.create_file(ROOT, "new", 0o644).await.unwrap();
        assert_eq!(store.read_dir(ROOT, 1, verifier).await.unwrap_err(), StoreError::NotFound);
    }
}
