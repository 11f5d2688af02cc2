//! Lock Manager (Cross-Protocol) (spec §2.F, §3.6, §4.7).
//!
//! A protocol-neutral byte-range lock registry shared between the NFSv4.1
//! state machine and the SMB2 surface. Entries are namespaced by owner-id
//! string so the two protocols can never collide (spec §9): NFS uses
//! `"nfs4:{client_id}:{owner_hex}"`, SMB uses `"smb:{session_id}:{owner}"`.
//!
//! https://datatracker.ietf.org/doc/html/rfc7530#section-9.4 — byte-range
//! locking semantics this registry implements independent of wire protocol.

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub owner_id: String,
    pub client_id: String,
    pub file_handle: Vec<u8>,
    pub offset: u64,
    pub length: u64,
    pub kind: LockKind,
    pub reclaim: bool,
}

pub const LENGTH_TO_EOF: u64 = u64::MAX;

impl Entry {
    fn end(&self) -> u64 {
        if self.length == LENGTH_TO_EOF {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length)
        }
    }

    fn overlaps(&self, other: &Entry) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Conflict rule (spec §3.6): overlapping ranges, different owners, and
    /// at least one side exclusive.
    fn conflicts_with(&self, other: &Entry) -> bool {
        self.file_handle == other.file_handle
            && self.owner_id != other.owner_id
            && self.overlaps(other)
            && (self.kind == LockKind::Exclusive || other.kind == LockKind::Exclusive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub offset: u64,
    pub length: u64,
    pub owner_id: String,
    pub kind_is_exclusive: bool,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
}

/// Internal mutex; operations are short and never call back into higher
/// layers (spec §4.7 thread model).
#[derive(Debug, Default)]
pub struct LockManager {
    inner: Mutex<Inner>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_enhanced_lock(&self, entry: Entry) -> Result<(), Conflict> {
        let mut inner = self.inner.lock().await;
        if let Some(conflict) = Self::find_conflict(&inner.entries, &entry) {
            return Err(conflict);
        }
        inner.entries.push(entry);
        Ok(())
    }

    pub async fn list_enhanced_locks(&self, file_handle: &[u8]) -> Vec<Entry> {
        let inner = self.inner.lock().await;
        inner.entries.iter().filter(|e| e.file_handle == file_handle).cloned().collect()
    }

    /// `LOCKT` (spec §4.5): query only, mutates nothing.
    pub async fn is_conflicting(&self, candidate: &Entry) -> Option<Conflict> {
        let inner = self.inner.lock().await;
        Self::find_conflict(&inner.entries, candidate)
    }

    /// Linear scan; tie-break by insertion order (spec §4.7) — the first
    /// matching entry in insertion order is reported.
    fn find_conflict(entries: &[Entry], candidate: &Entry) -> Option<Conflict> {
        entries.iter().find(|e| e.conflicts_with(candidate)).map(|e| Conflict {
            offset: e.offset,
            length: e.length,
            owner_id: e.owner_id.clone(),
            kind_is_exclusive: e.kind == LockKind::Exclusive,
        })
    }

    /// `LOCKU` (spec §3.6, §4.5): POSIX split on unlock. Releasing `[a,b)`
    /// from an owner's range(s) on `file_handle` produces 0, 1, or 2
    /// resulting locks per overlapping entry. "No such range" is success
    /// (idempotent).
    pub async fn remove_enhanced_lock(
        &self,
        owner_id: &str,
        file_handle: &[u8],
        offset: u64,
        length: u64,
    ) {
        let mut inner = self.inner.lock().await;
        let release_end = if length == LENGTH_TO_EOF { u64::MAX } else { offset.saturating_add(length) };

        let mut kept = Vec::with_capacity(inner.entries.len());
        for entry in inner.entries.drain(..) {
            if entry.owner_id != owner_id || entry.file_handle != file_handle {
                kept.push(entry);
                continue;
            }
            let entry_end = entry.end();
            if offset <= entry.offset && release_end >= entry_end {
                // fully released: 0 locks remain.
                continue;
            }
            if release_end <= entry.offset || offset >= entry_end {
                // no overlap: unchanged.
                kept.push(entry);
                continue;
            }
            if offset > entry.offset {
                kept.push(Entry { length: offset - entry.offset, ..entry.clone() });
            }
            if release_end < entry_end {
                let new_offset = release_end.max(entry.offset);
                let new_length =
                    if entry_end == u64::MAX { LENGTH_TO_EOF } else { entry_end - new_offset };
                kept.push(Entry { offset: new_offset, length: new_length, ..entry });
            }
        }
        inner.entries = kept;
    }

    /// Used on lease expiry and DESTROY_CLIENTID (spec §4.7).
    pub async fn remove_all_for_client(&self, client_id_namespaced: &str) {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|e| e.client_id != client_id_namespaced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: &str, client: &str, start: u64, len: u64, kind: LockKind) -> Entry {
        Entry { owner_id: owner.into(), client_id: client.into(), file_handle: b"/a".to_vec(), offset: start, length: len, kind, reclaim: false }
    }

    #[tokio::test]
    async fn conflicting_exclusive_locks_are_rejected() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "c1", 0, 100, LockKind::Exclusive)).await.unwrap();
        let err = mgr.add_enhanced_lock(entry("o2", "c2", 50, 100, LockKind::Exclusive)).await.unwrap_err();
        assert_eq!(err.owner_id, "o1");
    }

    #[tokio::test]
    async fn shared_locks_from_different_owners_coexist() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "c1", 0, 100, LockKind::Shared)).await.unwrap();
        mgr.add_enhanced_lock(entry("o2", "c2", 50, 100, LockKind::Shared)).await.unwrap();
        assert_eq!(mgr.list_enhanced_locks(b"/a").await.len(), 2);
    }

    #[tokio::test]
    async fn posix_split_middle_cut_leaves_two_ranges() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "c1", 0, 4096, LockKind::Exclusive)).await.unwrap();
        mgr.remove_enhanced_lock("o1", b"/a", 1024, 1024).await;
        let remaining = mgr.list_enhanced_locks(b"/a").await;
        assert_eq!(remaining.len(), 2);
        let mut ranges: Vec<(u64, u64)> = remaining.iter().map(|e| (e.offset, e.offset + e.length)).collect();
        ranges.sort();
        assert_eq!(ranges, vec![(0, 1024), (2048, 4096)]);
    }

    #[tokio::test]
    async fn posix_split_full_release_leaves_zero() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "c1", 0, 100, LockKind::Exclusive)).await.unwrap();
        mgr.remove_enhanced_lock("o1", b"/a", 0, 100).await;
        assert!(mgr.list_enhanced_locks(b"/a").await.is_empty());
    }

    #[tokio::test]
    async fn unlock_is_idempotent() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "c1", 0, 100, LockKind::Exclusive)).await.unwrap();
        mgr.remove_enhanced_lock("o1", b"/a", 0, 100).await;
        mgr.remove_enhanced_lock("o1", b"/a", 0, 100).await;
        assert!(mgr.list_enhanced_locks(b"/a").await.is_empty());
    }

    #[tokio::test]
    async fn remove_all_for_client_clears_its_entries_only() {
        let mgr = LockManager::new();
        mgr.add_enhanced_lock(entry("o1", "nfs4:1", 0, 100, LockKind::Shared)).await.unwrap();
        mgr.add_enhanced_lock(entry("o2", "nfs4:2", 200, 100, LockKind::Shared)).await.unwrap();
        mgr.remove_all_for_client("nfs4:1").await;
        let remaining = mgr.list_enhanced_locks(b"/a").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "nfs4:2");
    }
}
