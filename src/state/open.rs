//! Open-Owner / Open-State (spec §2.D, §3.4, §4.4).

use crate::client::ClientId;
use crate::error::{NfsError, NfsResult};
use std::collections::HashMap;

pub const SHARE_ACCESS_READ: u32 = 0x1;
pub const SHARE_ACCESS_WRITE: u32 = 0x2;
pub const SHARE_ACCESS_BOTH: u32 = SHARE_ACCESS_READ | SHARE_ACCESS_WRITE;

pub const SHARE_DENY_NONE: u32 = 0x0;
pub const SHARE_DENY_READ: u32 = 0x1;
pub const SHARE_DENY_WRITE: u32 = 0x2;
pub const SHARE_DENY_BOTH: u32 = SHARE_DENY_READ | SHARE_DENY_WRITE;

/// `{other: 12 bytes, seqid: u32}` naming a piece of server-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    pub other: [u8; 12],
    pub seqid: u32,
}

impl StateId {
    /// Deterministic `other` half: `H(client_id || owner_bytes ||
    /// file_handle)` (spec §9). Reuse on re-OPEN simplifies client retry.
    pub fn derive_other(client_id: ClientId, owner: &[u8], file_handle: &[u8]) -> [u8; 12] {
        use std::hash::{Hash, Hasher};
        // Two independent 64-bit hashes folded into 12 bytes; a real
        // implementation may prefer a dedicated hash, but the determinism
        // and collision-avoidance contract is what the spec pins down.
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        client_id.0.hash(&mut h1);
        owner.hash(&mut h1);
        file_handle.hash(&mut h1);
        let a = h1.finish();

        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        file_handle.hash(&mut h2);
        client_id.0.hash(&mut h2);
        owner.hash(&mut h2);
        0xabu8.hash(&mut h2);
        let b = h2.finish();

        let mut other = [0u8; 12];
        other[0..8].copy_from_slice(&a.to_be_bytes());
        other[8..12].copy_from_slice(&b.to_be_bytes()[0..4]);
        other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenOwnerKey {
    pub client_id: ClientId,
    pub owner: u64,
}

#[derive(Debug, Clone)]
pub struct OpenOwner {
    pub owner_bytes: Vec<u8>,
    pub last_seqid: u32,
    pub open_states: Vec<StateId>,
}

#[derive(Debug, Clone)]
pub struct OpenState {
    pub stateid: StateId,
    pub client_id: ClientId,
    pub owner_key: OpenOwnerKey,
    pub file_handle: Vec<u8>,
    pub share_access: u32,
    pub share_deny: u32,
    pub lock_states: Vec<crate::state::lock::StateId>,
}

impl OpenState {
    /// Verifies that `requested` deny bits do not conflict with any other
    /// open-state's access bits on the same file handle (spec §3.4).
    pub fn conflicts_with(requested_deny: u32, other_access: u32) -> bool {
        (requested_deny & SHARE_DENY_READ != 0 && other_access & SHARE_ACCESS_READ != 0)
            || (requested_deny & SHARE_DENY_WRITE != 0 && other_access & SHARE_ACCESS_WRITE != 0)
    }
}

/// All open-owners and open-states, keyed for O(1) lookup by owner and by
/// stateid. Storage lives inline on `StateManager::mu`; this struct is the
/// data shape plus the pure mutation logic spec §4.4 describes.
#[derive(Debug, Default)]
pub struct OpenTable {
    pub owners: HashMap<OpenOwnerKey, OpenOwner>,
    pub states: HashMap<StateId, OpenState>,
}

impl OpenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up every open-state for a file handle (linear scan; open
    /// tables are not expected to grow past a few hundred entries per
    /// file in practice).
    pub fn states_for_handle(&self, file_handle: &[u8]) -> Vec<&OpenState> {
        self.states.values().filter(|s| s.file_handle == file_handle).collect()
    }

    /// OPEN (spec §4.4): computes the new share bits, checks compatibility
    /// against other owners' opens on the same file, and allocates or
    /// updates the open-state.
    pub fn open(
        &mut self,
        client_id: ClientId,
        owner_bytes: Vec<u8>,
        file_handle: Vec<u8>,
        share_access: u32,
        share_deny: u32,
    ) -> NfsResult<StateId> {
        let owner_hash = hash_owner(&owner_bytes);
        let owner_key = OpenOwnerKey { client_id, owner: owner_hash };

        let existing_for_owner = self
            .states
            .values()
            .find(|s| s.owner_key == owner_key && s.file_handle == file_handle)
            .map(|s| s.stateid);

        let new_access = existing_for_owner
            .and_then(|id| self.states.get(&id))
            .map(|s| s.share_access | share_access)
            .unwrap_or(share_access);
        let new_deny = existing_for_owner
            .and_then(|id| self.states.get(&id))
            .map(|s| s.share_deny | share_deny)
            .unwrap_or(share_deny);

        for other in self.states_for_handle(&file_handle) {
            if other.owner_key == owner_key {
                continue;
            }
            if OpenState::conflicts_with(new_deny, other.share_access)
                || OpenState::conflicts_with(other.share_deny, new_access)
            {
                return Err(NfsError::ShareDenied);
            }
        }

        let other = StateId::derive_other(client_id, &owner_bytes, &file_handle);
        let stateid = match existing_for_owner {
            Some(mut id) => {
                id.seqid = id.seqid.wrapping_add(1);
                id
            }
            None => StateId { other, seqid: 1 },
        };

        self.owners
            .entry(owner_key)
            .or_insert_with(|| OpenOwner { owner_bytes: owner_bytes.clone(), last_seqid: 0, open_states: Vec::new() });

        if let Some(old_id) = existing_for_owner {
            self.states.remove(&old_id);
        }
        self.states.insert(
            stateid,
            OpenState {
                stateid,
                client_id,
                owner_key,
                file_handle,
                share_access: new_access,
                share_deny: new_deny,
                lock_states: Vec::new(),
            },
        );
        let owner = self.owners.get_mut(&owner_key).unwrap();
        owner.open_states.retain(|s| Some(*s) != existing_for_owner);
        owner.open_states.push(stateid);

        Ok(stateid)
    }

    /// CLOSE (spec §4.4): fails with `LOCKS_HELD` if any lock-state remains.
    pub fn close(&mut self, stateid: StateId) -> NfsResult<()> {
        let state = self.states.get(&stateid).ok_or(NfsError::BadStateid)?;
        if !state.lock_states.is_empty() {
            return Err(NfsError::LocksHeld);
        }
        let owner_key = state.owner_key;
        self.states.remove(&stateid);
        if let Some(owner) = self.owners.get_mut(&owner_key) {
            owner.open_states.retain(|s| *s != stateid);
            if owner.open_states.is_empty() {
                self.owners.remove(&owner_key);
            }
        }
        Ok(())
    }

    /// OPEN_DOWNGRADE (spec §4.4): the requested bits must be a strict
    /// subset of the current share bits (Open Question resolved in
    /// DESIGN.md: the all-zero case, equivalent to a close, is permitted).
    pub fn downgrade(&mut self, stateid: StateId, access: u32, deny: u32) -> NfsResult<StateId> {
        let state = self.states.get_mut(&stateid).ok_or(NfsError::BadStateid)?;
        if access & !state.share_access != 0 || deny & !state.share_deny != 0 {
            return Err(NfsError::Invalid);
        }
        state.share_access = access;
        state.share_deny = deny;
        let mut new_id = stateid;
        new_id.seqid = new_id.seqid.wrapping_add(1);
        state.stateid = new_id;
        let old = self.states.remove(&stateid).unwrap();
        self.states.insert(new_id, old);
        if let Some(owner) = self.owners.get_mut(&state_owner_key(&self.states, new_id)) {
            for s in owner.open_states.iter_mut() {
                if *s == stateid {
                    *s = new_id;
                }
            }
        }
        Ok(new_id)
    }

    /// Tears down every open-state (and owning owner) for a client, used on
    /// lease expiry / DESTROY_CLIENTID (spec §7 atomicity invariant).
    pub fn remove_all_for_client(&mut self, client_id: ClientId) {
        self.states.retain(|_, s| s.client_id != client_id);
        self.owners.retain(|k, _| k.client_id != client_id);
    }
}

fn state_owner_key(states: &HashMap<StateId, OpenState>, id: StateId) -> OpenOwnerKey {
    states.get(&id).map(|s| s.owner_key).unwrap_or(OpenOwnerKey { client_id: ClientId(0), owner: 0 })
}

fn hash_owner(owner_bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    owner_bytes.hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_close_round_trip() {
        let mut table = OpenTable::new();
        let id = table
            .open(ClientId(1), b"owner1".to_vec(), b"/a".to_vec(), SHARE_ACCESS_READ, SHARE_DENY_NONE)
            .unwrap();
        assert!(table.states.contains_key(&id));
        table.close(id).unwrap();
        assert!(!table.states.contains_key(&id));
    }

    #[test]
    fn conflicting_deny_is_rejected() {
        let mut table = OpenTable::new();
        table
            .open(ClientId(1), b"owner1".to_vec(), b"/a".to_vec(), SHARE_ACCESS_WRITE, SHARE_DENY_NONE)
            .unwrap();
        let err = table
            .open(ClientId(2), b"owner2".to_vec(), b"/a".to_vec(), SHARE_ACCESS_READ, SHARE_DENY_WRITE)
            .unwrap_err();
        assert_eq!(err, NfsError::ShareDenied);
    }

    #[test]
    fn close_with_lock_states_fails() {
        let mut table = OpenTable::new();
        let id = table
            .open(ClientId(1), b"owner1".to_vec(), b"/a".to_vec(), SHARE_ACCESS_WRITE, SHARE_DENY_NONE)
            .unwrap();
        table.states.get_mut(&id).unwrap().lock_states.push(crate::state::lock::StateId {
            other: [0; 12],
            seqid: 1,
        });
        let err = table.close(id).unwrap_err();
        assert_eq!(err, NfsError::LocksHeld);
    }

    #[test]
    fn downgrade_rejects_non_subset() {
        let mut table = OpenTable::new();
        let id = table
            .open(ClientId(1), b"owner1".to_vec(), b"/a".to_vec(), SHARE_ACCESS_READ, SHARE_DENY_NONE)
            .unwrap();
        let err = table.downgrade(id, SHARE_ACCESS_BOTH, SHARE_DENY_NONE).unwrap_err();
        assert_eq!(err, NfsError::Invalid);
    }

    #[test]
    fn remove_all_for_client_clears_owner_and_states() {
        let mut table = OpenTable::new();
        table
            .open(ClientId(1), b"owner1".to_vec(), b"/a".to_vec(), SHARE_ACCESS_READ, SHARE_DENY_NONE)
            .unwrap();
        table.remove_all_for_client(ClientId(1));
        assert!(table.states.is_empty());
        assert!(table.owners.is_empty());
    }
}
