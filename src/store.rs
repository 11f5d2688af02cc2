//! Store interfaces consumed by the protocol core (spec §6.2).
//!
//! No production backend ships in this crate — `demos::memstore` is the only
//! implementation, used by tests. Real filesystem/S3-compatible backends are
//! external collaborators.

use async_trait::async_trait;
use std::time::SystemTime;

/// Opaque identifier of a file's payload in the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub u64);

/// Error set returned by `MetadataStore`/`ContentStore` methods (spec §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Exists,
    NotEmpty,
    NotDir,
    IsDir,
    Io,
    Denied,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
    pub content_id: ContentId,
}

/// Partial attribute update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
}

/// Opaque node identifier within a metadata store (directory-tree node, not
/// an NFS file handle — the dispatcher owns the mapping between the two).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
    pub cookie: u64,
}

/// Directory tree and attribute store (spec §6.2). Out of scope to implement
/// beyond trait boundaries; `demos::memstore` is the only implementation in
/// this crate.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn lookup(&self, dir: NodeId, name: &str) -> StoreResult<NodeId>;
    async fn create_file(&self, dir: NodeId, name: &str, mode: u32) -> StoreResult<NodeId>;
    async fn create_dir(&self, dir: NodeId, name: &str, mode: u32) -> StoreResult<NodeId>;
    async fn remove(&self, dir: NodeId, name: &str) -> StoreResult<()>;
    async fn rename(
        &self,
        src_dir: NodeId,
        src_name: &str,
        dst_dir: NodeId,
        dst_name: &str,
    ) -> StoreResult<()>;
    async fn link(&self, dir: NodeId, name: &str, target: NodeId) -> StoreResult<()>;
    async fn get_attr(&self, node: NodeId) -> StoreResult<Attr>;
    async fn set_attr(&self, node: NodeId, attr: SetAttr) -> StoreResult<Attr>;
    /// `cookie == 0` starts from the beginning; `verifier` must match the one
    /// returned with the directory's first page or the read fails with
    /// `NotFound` (cookie stale across a directory mutation).
    async fn read_dir(
        &self,
        dir: NodeId,
        cookie: u64,
        verifier: u64,
    ) -> StoreResult<(Vec<DirEntry>, u64, bool)>;
    async fn content_id_of(&self, node: NodeId) -> StoreResult<ContentId>;
}

/// Payload byte-storage backend (spec §6.2).
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn read_at(&self, id: ContentId, buf: &mut [u8], offset: u64) -> StoreResult<usize>;
    async fn get_content_size(&self, id: ContentId) -> StoreResult<u64>;
    async fn content_exists(&self, id: ContentId) -> StoreResult<bool>;
    async fn write_at(&self, id: ContentId, data: &[u8], offset: u64) -> StoreResult<()>;
    async fn truncate(&self, id: ContentId, size: u64) -> StoreResult<()>;
    async fn delete(&self, id: ContentId) -> StoreResult<()>;
    async fn write_content(&self, id: ContentId, bytes: &[u8]) -> StoreResult<()>;
}

/// Incremental-write state reported back to the flusher (spec §4.11, §6.2).
#[derive(Debug, Clone, Copy)]
pub struct IncrementalWriteState {
    pub upload_id: u64,
    pub parts_written: u32,
    pub parts_writing: u32,
    pub total_flushed: u64,
}

/// Multipart-capable content store (spec §6.2). A store that does not
/// implement this trait is treated by the flusher as complete once
/// `flushed_offset == size` (see `crate::flusher`).
#[async_trait]
pub trait IncrementalWriteStore: ContentStore {
    async fn begin_incremental_write(&self, id: ContentId) -> StoreResult<u64>;
    /// Flushes any cache-resident bytes not yet part of an uploaded part;
    /// returns the number of bytes newly uploaded.
    async fn flush_incremental(
        &self,
        id: ContentId,
        cache: &crate::cache::Cache,
    ) -> StoreResult<u64>;
    async fn complete_incremental_write(
        &self,
        id: ContentId,
        cache: &crate::cache::Cache,
    ) -> StoreResult<()>;
    async fn abort_incremental_write(&self, id: ContentId) -> StoreResult<()>;
    async fn get_incremental_write_state(
        &self,
        id: ContentId,
    ) -> StoreResult<Option<IncrementalWriteState>>;
}

/// Deterministic multipart part numbering (spec §6.2): `part_number =
/// (offset / part_size) + 1`.
pub fn part_number(offset: u64, part_size: u64) -> u64 {
    offset / part_size + 1
}
