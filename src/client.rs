//! Client Registry records (spec §2.C, §3.1).
//!
//! Two client variants share one table: legacy v4.0 clients confirmed via
//! SETCLIENTID_CONFIRM, and v4.1 clients confirmed by their first successful
//! CREATE_SESSION. Storage and lifetime live on `state::StateManager`; this
//! module only defines the record shape and its lease arithmetic, mirroring
//! the split the pack's own session module draws between `NfsClient` (data)
//! and `SessionManager` (storage).

use std::time::{Duration, Instant};

/// 64-bit opaque client id, unique over the server's boot epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVariant {
    /// SETCLIENTID / SETCLIENTID_CONFIRM.
    V40,
    /// EXCHANGE_ID / CREATE_SESSION.
    V41,
}

#[derive(Debug, Clone, Copy)]
pub struct CallbackProgram {
    pub program: u32,
    pub r_addr_netid: u32,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: ClientId,
    pub variant: ClientVariant,
    pub owner_id: Vec<u8>,
    pub verifier: [u8; 8],
    pub confirmed: bool,
    /// v4.1 only: monotonic counter for CREATE_SESSION replay detection.
    pub sequence_id: u32,
    /// v4.1 only: last full encoded CREATE_SESSION response, for replay.
    pub cached_create_session_reply: Option<Vec<u8>>,
    /// v4.0 only: the verifier returned by SETCLIENTID, awaiting
    /// SETCLIENTID_CONFIRM to match it back.
    pub confirm_verifier: Option<[u8; 8]>,
    pub lease_expiry: Instant,
    pub callback_program: Option<CallbackProgram>,
    pub sessions: Vec<crate::session::SessionId>,
    created_at: Instant,
}

/// Deterministic SETCLIENTID confirm-verifier, mirroring
/// `state::open::StateId::derive_other`'s double-hash derivation.
pub fn derive_confirm_verifier(client_id: ClientId, verifier: &[u8; 8]) -> [u8; 8] {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    client_id.0.hash(&mut h);
    verifier.hash(&mut h);
    0x40u8.hash(&mut h);
    h.finish().to_be_bytes()
}

impl Client {
    pub fn new(
        client_id: ClientId,
        variant: ClientVariant,
        owner_id: Vec<u8>,
        verifier: [u8; 8],
        now: Instant,
        lease: Duration,
    ) -> Self {
        Client {
            client_id,
            variant,
            owner_id,
            verifier,
            confirmed: false,
            sequence_id: 0,
            cached_create_session_reply: None,
            confirm_verifier: None,
            lease_expiry: now + lease,
            callback_program: None,
            sessions: Vec::new(),
            created_at: now,
        }
    }

    pub fn is_lease_expired(&self, now: Instant) -> bool {
        now >= self.lease_expiry
    }

    pub fn renew_lease(&mut self, now: Instant, lease: Duration) {
        self.lease_expiry = now + lease;
    }

    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Unconfirmed clients older than `2 * lease` are reaped (spec §4.2).
    pub fn is_stale_unconfirmed(&self, now: Instant, lease: Duration) -> bool {
        !self.confirmed && now.duration_since(self.created_at) >= lease * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_arithmetic() {
        let now = Instant::now();
        let mut c = Client::new(
            ClientId(1),
            ClientVariant::V41,
            b"owner".to_vec(),
            [0; 8],
            now,
            Duration::from_secs(10),
        );
        assert!(!c.is_lease_expired(now));
        assert!(c.is_lease_expired(now + Duration::from_secs(11)));
        c.renew_lease(now + Duration::from_secs(5), Duration::from_secs(10));
        assert!(!c.is_lease_expired(now + Duration::from_secs(14)));
    }

    #[test]
    fn unconfirmed_clients_go_stale_at_twice_lease() {
        let now = Instant::now();
        let c = Client::new(
            ClientId(1),
            ClientVariant::V41,
            b"owner".to_vec(),
            [0; 8],
            now,
            Duration::from_secs(10),
        );
        assert!(!c.is_stale_unconfirmed(now + Duration::from_secs(15), Duration::from_secs(10)));
        assert!(c.is_stale_unconfirmed(now + Duration::from_secs(20), Duration::from_secs(10)));
    }
}
