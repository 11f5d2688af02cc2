//! SMB2 Session Authentication Surface (spec §2.M, §4.12).
//!
//! Covers only the SESSION_SETUP identity path: SPNEGO token routing
//! through `crate::auth::AuthChain`, principal-to-local-user mapping, and
//! binding the result onto a session record. SMB2 transport framing and
//! every other SMB2 command are out of scope (spec §1 Non-goals).

use crate::auth::{AuthChain, AuthError, Principal};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmbSessionId(pub u64);

/// Identity bound onto an SMB session after a successful SESSION_SETUP
/// (spec §4.12 step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundIdentity {
    pub local_user: String,
    pub domain_or_realm: String,
    pub principal_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupResponse {
    pub session_id: SmbSessionId,
    pub identity: BoundIdentity,
    /// SPNEGO accept-complete blob stored for the wire layer to send back;
    /// its encoding is out of scope here (spec §1 Non-goals).
    pub spnego_accept_complete: Vec<u8>,
}

/// Maps an authenticated principal to a local user; absent entries are a
/// hard failure (spec §4.12 step 4: "guest-check is out of scope").
pub trait UserStore: Send + Sync {
    fn resolve(&self, local_user: &str) -> Option<String>;
}

/// In-memory user store good enough for tests and the memstore demo.
pub struct StaticUserStore {
    users: HashMap<String, String>,
}

impl StaticUserStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        StaticUserStore { users }
    }
}

impl UserStore for StaticUserStore {
    fn resolve(&self, local_user: &str) -> Option<String> {
        self.users.get(local_user).cloned()
    }
}

/// Owns the SPNEGO-to-session flow for one SMB2 listener. Session records
/// are keyed by `SmbSessionId`, allocated by whatever owns the SMB2
/// transport (out of scope here).
pub struct SmbSessionRegistry {
    chain: Arc<AuthChain>,
    users: Arc<dyn UserStore>,
    sessions: RwLock<HashMap<SmbSessionId, BoundIdentity>>,
}

impl SmbSessionRegistry {
    pub fn new(chain: Arc<AuthChain>, users: Arc<dyn UserStore>) -> Self {
        SmbSessionRegistry { chain, users, sessions: RwLock::new(HashMap::new()) }
    }

    /// Runs the SESSION_SETUP identity flow (spec §4.12 steps 1-5) against
    /// an already-extracted SPNEGO initiator token and binds the result to
    /// `session_id`.
    pub async fn session_setup(
        &self,
        session_id: SmbSessionId,
        spnego_token: &[u8],
    ) -> Result<SessionSetupResponse, AuthError> {
        let principal = self.chain.authenticate(spnego_token)?;
        let identity = self.bind_identity(principal)?;
        self.sessions.write().await.insert(session_id, identity.clone());
        info!(local_user = %identity.local_user, "smb session setup accepted");
        Ok(SessionSetupResponse {
            session_id,
            identity,
            spnego_accept_complete: encode_accept_complete(),
        })
    }

    fn bind_identity(&self, principal: Principal) -> Result<BoundIdentity, AuthError> {
        let local_user = self.users.resolve(&principal.local_user).ok_or_else(|| {
            warn!(principal = %principal.name, "no local user mapping for authenticated principal");
            AuthError::NoLocalUser
        })?;
        Ok(BoundIdentity { local_user, domain_or_realm: principal.realm_or_domain, principal_name: principal.name })
    }

    pub async fn identity_of(&self, session_id: SmbSessionId) -> Option<BoundIdentity> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn drop_session(&self, session_id: SmbSessionId) {
        self.sessions.write().await.remove(&session_id);
    }
}

/// Placeholder SPNEGO accept-complete encoding: the real negTokenTarg DER
/// structure is out of scope (spec §1 Non-goals), but callers need a
/// deterministic, non-empty byte sequence to exercise the write path.
fn encode_accept_complete() -> Vec<u8> {
    vec![0xa1, 0x00]
}
