//! Lock-Owner / Lock-State (spec §2.E, §3.5).
//!
//! Lock-states hold no byte ranges themselves — those live in
//! `crate::lockmgr::LockManager`, keyed by the cross-protocol owner-id
//! string built from `(client_id, lock_owner_bytes)`. This module only
//! tracks the (file, owner) → lock-state bridge and sequencing.

use crate::client::ClientId;
use crate::error::{NfsError, NfsResult};
use crate::state::open::StateId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwnerKey {
    pub client_id: ClientId,
    pub owner: u64,
}

#[derive(Debug, Clone)]
pub struct LockOwner {
    pub owner_bytes: Vec<u8>,
    pub last_seqid: u32,
    pub lock_states: Vec<StateId>,
}

#[derive(Debug, Clone)]
pub struct LockState {
    pub stateid: StateId,
    pub open_stateid: StateId,
    pub owner_key: LockOwnerKey,
    pub file_handle: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct LockStateTable {
    pub owners: HashMap<LockOwnerKey, LockOwner>,
    pub states: HashMap<StateId, LockState>,
}

impl LockStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the namespaced owner-id string the cross-protocol Lock
    /// Manager uses (spec §3.6, §9): `"nfs4:{client_id}:{owner_hex}"`.
    pub fn namespaced_owner_id(client_id: ClientId, owner_bytes: &[u8]) -> String {
        format!("nfs4:{}:{}", client_id.0, hex(owner_bytes))
    }

    pub fn namespaced_client_id(client_id: ClientId) -> String {
        format!("nfs4:{}", client_id.0)
    }

    /// `LOCK` with `new_lock_owner == true` (spec §4.5): creates a fresh
    /// lock-owner and lock-state bridging to `open_stateid`.
    pub fn create_lock_state(
        &mut self,
        client_id: ClientId,
        owner_bytes: Vec<u8>,
        open_stateid: StateId,
        file_handle: Vec<u8>,
    ) -> StateId {
        let owner_hash = hash_owner(&owner_bytes);
        let owner_key = LockOwnerKey { client_id, owner: owner_hash };
        let other = StateId::derive_other(client_id, &owner_bytes, &file_handle);
        let stateid = StateId { other, seqid: 1 };

        self.owners
            .entry(owner_key)
            .or_insert_with(|| LockOwner { owner_bytes, last_seqid: 0, lock_states: Vec::new() })
            .lock_states
            .push(stateid);

        self.states.insert(stateid, LockState { stateid, open_stateid, owner_key, file_handle });
        stateid
    }

    /// `LOCK` with `new_lock_owner == false` (spec §4.5): reuses the
    /// existing lock-state for `(file, owner)`.
    pub fn find_existing(&self, client_id: ClientId, owner_bytes: &[u8], file_handle: &[u8]) -> Option<StateId> {
        let owner_key = LockOwnerKey { client_id, owner: hash_owner(owner_bytes) };
        self.states
            .values()
            .find(|s| s.owner_key == owner_key && s.file_handle == file_handle)
            .map(|s| s.stateid)
    }

    /// `RELEASE_LOCKOWNER` (spec §4.5): fails if the Lock Manager still
    /// reports ranges held by this owner; the caller is expected to have
    /// checked that before calling.
    pub fn release_owner(&mut self, client_id: ClientId, owner_bytes: &[u8]) -> NfsResult<()> {
        let owner_key = LockOwnerKey { client_id, owner: hash_owner(owner_bytes) };
        let owner = self.owners.get(&owner_key).ok_or(NfsError::BadStateid)?;
        for stateid in owner.lock_states.clone() {
            self.states.remove(&stateid);
        }
        self.owners.remove(&owner_key);
        Ok(())
    }

    pub fn remove_all_for_client(&mut self, client_id: ClientId) {
        self.states.retain(|_, s| s.owner_key.client_id != client_id);
        self.owners.retain(|k, _| k.client_id != client_id);
    }
}

fn hash_owner(owner_bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    owner_bytes.hash(&mut h);
    h.finish()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
