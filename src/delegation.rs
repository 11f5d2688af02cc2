//! Delegation Engine (spec §2.G, §3.7, §4.6).
//!
//! File read/write delegations and directory delegations share one table,
//! indexed by both `stateid.other` and file handle. Recall/revoke drives the
//! Backchannel Sender (§4.8) through the `CallbackSink` seam, so this module
//! does not depend on `backchannel` directly — the two are wired together by
//! `state::StateManager`.

use crate::client::ClientId;
use crate::config::Config;
use crate::counters::{Counters, DelegationKind as CounterKind};
use crate::state::open::StateId;
use moka::sync::Cache as MokaCache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    FileRead,
    FileWrite,
    Directory,
}

/// Directory-mutation event bits (spec §4.6).
pub mod mask {
    pub const ADD: u32 = 0x1;
    pub const REMOVE: u32 = 0x2;
    pub const RENAME: u32 = 0x4;
    pub const ATTR: u32 = 0x8;
}

#[derive(Debug, Clone)]
pub enum NotifyEvent {
    AddEntry { name: String },
    RemoveEntry { name: String },
    RenameEntry { old_name: String, new_name: String },
    AttrChanged,
}

impl NotifyEvent {
    fn mask_bit(&self) -> u32 {
        match self {
            NotifyEvent::AddEntry { .. } => mask::ADD,
            NotifyEvent::RemoveEntry { .. } => mask::REMOVE,
            NotifyEvent::RenameEntry { .. } => mask::RENAME,
            NotifyEvent::AttrChanged => mask::ATTR,
        }
    }
}

#[derive(Debug, Default)]
struct PendingBatch {
    events: Vec<NotifyEvent>,
    flush_deadline: Option<Instant>,
}

pub struct Delegation {
    pub stateid: StateId,
    pub client_id: ClientId,
    pub file_handle: Vec<u8>,
    pub kind: Kind,
    pub recall_sent: bool,
    pub revoked: bool,
    pub recall_deadline: Option<Instant>,
    pub recall_reason: Option<String>,
    /// Directory delegations only.
    pub notification_mask: u32,
    pub cookie_verifier: u64,
    pending: AsyncMutex<PendingBatch>,
}

impl std::fmt::Debug for Delegation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegation")
            .field("stateid", &self.stateid)
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Sink the engine calls to actually push CB_RECALL/CB_NOTIFY onto a
/// session's back channel; implemented by `crate::backchannel`.
pub trait CallbackSink: Send + Sync {
    fn enqueue_recall(&self, client_id: ClientId, stateid: StateId, reason: &str);
    fn enqueue_notify(&self, client_id: ClientId, dir_handle: Vec<u8>, stateid: StateId, events: Vec<NotifyEvent>);
}

pub struct DelegationEngine {
    by_stateid: HashMap<StateId, Arc<Delegation>>,
    by_handle: HashMap<Vec<u8>, Vec<StateId>>,
    recently_revoked: MokaCache<StateId, ()>,
    directory_cap: usize,
    batch_window: Duration,
    batch_max: usize,
    counters: Arc<Counters>,
}

impl DelegationEngine {
    pub fn new(cfg: &Config, counters: Arc<Counters>) -> Self {
        DelegationEngine {
            by_stateid: HashMap::new(),
            by_handle: HashMap::new(),
            recently_revoked: MokaCache::builder().time_to_live(cfg.recently_revoked_ttl()).build(),
            directory_cap: cfg.directory_delegation_cap,
            batch_window: cfg.notification_batch_window(),
            batch_max: cfg.notification_batch_max,
            counters,
        }
    }

    /// Granting policy (spec §4.6): read delegation only when no conflicting
    /// write opens exist from other clients and a back channel is bound.
    pub fn try_grant_file_read(
        &mut self,
        client_id: ClientId,
        file_handle: Vec<u8>,
        conflicting_write_opens_exist: bool,
        back_channel_bound: bool,
    ) -> Option<StateId> {
        if conflicting_write_opens_exist || !back_channel_bound {
            return None;
        }
        let other = StateId::derive_other(client_id, b"deleg", &file_handle);
        let stateid = StateId { other, seqid: 1 };
        let deleg = Arc::new(Delegation {
            stateid,
            client_id,
            file_handle: file_handle.clone(),
            kind: Kind::FileRead,
            recall_sent: false,
            revoked: false,
            recall_deadline: None,
            recall_reason: None,
            notification_mask: 0,
            cookie_verifier: 0,
            pending: AsyncMutex::new(PendingBatch::default()),
        });
        self.insert(deleg);
        self.counters.delegation_granted(CounterKind::File);
        Some(stateid)
    }

    /// `GET_DIR_DELEGATION` (spec §4.6): grants unless the client's lease is
    /// invalid, the cap is reached, or there is no back channel.
    pub fn try_grant_directory(
        &mut self,
        client_id: ClientId,
        dir_handle: Vec<u8>,
        notification_mask: u32,
        back_channel_bound: bool,
    ) -> Option<StateId> {
        let existing_dir_delegations =
            self.by_handle.get(&dir_handle).map(|v| v.len()).unwrap_or(0);
        if !back_channel_bound || existing_dir_delegations >= self.directory_cap {
            return None;
        }
        let other = StateId::derive_other(client_id, b"dirdeleg", &dir_handle);
        let stateid = StateId { other, seqid: 1 };
        let deleg = Arc::new(Delegation {
            stateid,
            client_id,
            file_handle: dir_handle.clone(),
            kind: Kind::Directory,
            recall_sent: false,
            revoked: false,
            recall_deadline: None,
            recall_reason: None,
            notification_mask,
            cookie_verifier: rand::random(),
            pending: AsyncMutex::new(PendingBatch::default()),
        });
        self.insert(deleg);
        self.counters.delegation_granted(CounterKind::Directory);
        Some(stateid)
    }

    fn insert(&mut self, deleg: Arc<Delegation>) {
        self.by_handle.entry(deleg.file_handle.clone()).or_default().push(deleg.stateid);
        self.by_stateid.insert(deleg.stateid, deleg);
    }

    pub fn get(&self, stateid: &StateId) -> Option<Arc<Delegation>> {
        self.by_stateid.get(stateid).cloned()
    }

    /// All delegations (any kind) on a file handle; used to detect
    /// conflicts and to find directory delegation holders to notify.
    pub fn holders_for_handle(&self, file_handle: &[u8]) -> Vec<Arc<Delegation>> {
        self.by_handle
            .get(file_handle)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_stateid.get(id).cloned())
            .collect()
    }

    /// Recall trigger (spec §4.6): marks `recall_sent`, starts the deadline,
    /// and enqueues CB_RECALL via the sink. Caller already released
    /// `state_manager.mu` per the lock-hierarchy rule before this runs (the
    /// sink itself only touches per-session queues).
    pub fn recall(&mut self, stateid: StateId, reason: &str, lease: Duration, sink: &dyn CallbackSink) {
        if let Some(deleg) = self.by_stateid.get(&stateid) {
            // Deleg fields besides the Arc-shared `pending` are not
            // interior-mutable; replace the entry to flip recall_sent.
            let mut updated = Delegation {
                stateid: deleg.stateid,
                client_id: deleg.client_id,
                file_handle: deleg.file_handle.clone(),
                kind: deleg.kind,
                recall_sent: true,
                revoked: deleg.revoked,
                recall_deadline: Some(Instant::now() + lease),
                recall_reason: Some(reason.to_string()),
                notification_mask: deleg.notification_mask,
                cookie_verifier: deleg.cookie_verifier,
                pending: AsyncMutex::new(PendingBatch::default()),
            };
            let kind = updated.kind;
            self.counters.delegation_recalled(match kind {
                Kind::Directory => CounterKind::Directory,
                _ => CounterKind::File,
            });
            sink.enqueue_recall(updated.client_id, stateid, reason);
            updated.recall_sent = true;
            self.by_stateid.insert(stateid, Arc::new(updated));
        }
    }

    /// DELEGRETURN: frees the delegation. Returns `true` if it was a live
    /// delegation, `false` if it resolves via the recently-revoked set
    /// (spec §4.6 scenario 4) — both are success from the caller's view.
    pub fn delegreturn(&mut self, stateid: StateId) -> bool {
        if let Some(deleg) = self.by_stateid.remove(&stateid) {
            self.remove_from_handle_index(&deleg.file_handle, stateid);
            true
        } else {
            // Late DELEGRETURN for an already-revoked delegation still
            // resolves OK (spec §4.6 scenario 4) as long as it is within
            // the recently-revoked TTL window.
            self.recently_revoked.contains_key(&stateid)
        }
    }

    /// Called by the reaper when `recall_deadline` has passed without a
    /// DELEGRETURN: marks revoked and remembers the id for a late return.
    pub fn revoke_expired(&mut self, now: Instant) -> Vec<StateId> {
        let expired: Vec<(StateId, Vec<u8>)> = self
            .by_stateid
            .values()
            .filter(|d| d.recall_sent && !d.revoked && d.recall_deadline.map(|dl| now >= dl).unwrap_or(false))
            .map(|d| (d.stateid, d.file_handle.clone()))
            .collect();
        let mut ids = Vec::with_capacity(expired.len());
        for (stateid, file_handle) in expired {
            self.by_stateid.remove(&stateid);
            self.remove_from_handle_index(&file_handle, stateid);
            self.recently_revoked.insert(stateid, ());
            self.counters.delegation_revoked(CounterKind::File);
            ids.push(stateid);
        }
        ids
    }

    fn remove_from_handle_index(&mut self, file_handle: &[u8], stateid: StateId) {
        if let Some(list) = self.by_handle.get_mut(file_handle) {
            list.retain(|s| *s != stateid);
        }
    }

    /// Immediate revocation on directory deletion while delegated (spec
    /// §4.6): does not wait for recall.
    pub fn revoke_directory(&mut self, dir_handle: &[u8]) -> Vec<StateId> {
        let ids: Vec<StateId> = self
            .by_handle
            .get(dir_handle)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for id in &ids {
            self.by_stateid.remove(id);
            self.recently_revoked.insert(*id, ());
        }
        self.by_handle.remove(dir_handle);
        ids
    }

    pub fn remove_all_for_client(&mut self, client_id: ClientId) {
        let ids: Vec<(StateId, Vec<u8>)> = self
            .by_stateid
            .values()
            .filter(|d| d.client_id == client_id)
            .map(|d| (d.stateid, d.file_handle.clone()))
            .collect();
        for (id, file_handle) in ids {
            self.by_stateid.remove(&id);
            self.remove_from_handle_index(&file_handle, id);
        }
    }

    /// Applies the attribute-change significance filter (spec §4.6): only
    /// size/mode/uid/gid notify, atime/ctime-only changes do not.
    pub fn is_significant_attr_change(size: bool, mode: bool, uid: bool, gid: bool) -> bool {
        size || mode || uid || gid
    }

    /// `notify_dir_change` (spec §4.6): appends to each directory
    /// delegation holder's pending batch (filtered by `notification_mask`),
    /// flushing immediately if the batch is full or starting the window
    /// timer if this is the first pending event.
    pub async fn notify_dir_change(&self, dir_handle: &[u8], event: NotifyEvent, sink: &dyn CallbackSink) {
        for deleg in self.holders_for_handle(dir_handle) {
            if deleg.kind != Kind::Directory || deleg.notification_mask & event.mask_bit() == 0 {
                continue;
            }
            let should_flush = {
                let mut pending = deleg.pending.lock().await;
                pending.events.push(event.clone());
                if pending.flush_deadline.is_none() {
                    pending.flush_deadline = Some(Instant::now() + self.batch_window);
                }
                pending.events.len() >= self.batch_max
            };
            if should_flush {
                self.flush(&deleg, sink).await;
            }
        }
    }

    /// Timer-driven or DELEGRETURN-driven flush (spec §4.6): swaps the
    /// pending list under the per-delegation mutex, releases, then encodes
    /// one CB_NOTIFY for everything collected.
    pub async fn flush(&self, deleg: &Delegation, sink: &dyn CallbackSink) {
        let events = {
            let mut pending = deleg.pending.lock().await;
            pending.flush_deadline = None;
            std::mem::take(&mut pending.events)
        };
        if !events.is_empty() {
            sink.enqueue_notify(deleg.client_id, deleg.file_handle.clone(), deleg.stateid, events);
        }
    }

    /// Polled by a background tick to find batches whose window expired
    /// (spec §4.6 flush trigger = timer expiry OR queue size cap).
    pub async fn flush_expired(&self, now: Instant, sink: &dyn CallbackSink) {
        for deleg in self.by_stateid.values() {
            if deleg.kind != Kind::Directory {
                continue;
            }
            let expired = {
                let pending = deleg.pending.lock().await;
                pending.flush_deadline.map(|dl| now >= dl).unwrap_or(false)
            };
            if expired {
                self.flush(deleg, sink).await;
            }
        }
    }
}
