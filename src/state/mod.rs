//! State Manager: the single write-locked home for components C/D/E (spec
//! §2, §5, §9). Client registry, open-state table, and lock-state table all
//! live behind one `tokio::sync::RwLock` (`mu` in the spec's lock
//! hierarchy); the Lock Manager (F) and Delegation Engine (G) guard their
//! own tables internally and are reached only through methods here so
//! callers never have to reason about acquisition order themselves.

pub mod lock;
pub mod open;

use crate::backchannel::{BackchannelRegistry, Sender as BackchannelSender};
use crate::client::{derive_confirm_verifier, CallbackProgram, Client, ClientId, ClientVariant};
use crate::config::Config;
use crate::connection::ConnectionBinding;
use crate::counters::Counters;
use crate::delegation::{CallbackSink, DelegationEngine, NotifyEvent};
use crate::error::{NfsError, NfsResult};
use crate::lockmgr::{Conflict, Entry as LockEntry, LockKind, LockManager};
use crate::session::{ChannelAttrs, ConnDirection, Session, SessionId};
use open::{OpenTable, StateId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct Inner {
    clients: HashMap<ClientId, Client>,
    sessions: HashMap<SessionId, Session>,
    open_table: OpenTable,
    lock_state_table: lock::LockStateTable,
}

impl Inner {
    fn new() -> Self {
        Inner {
            clients: HashMap::new(),
            sessions: HashMap::new(),
            open_table: OpenTable::new(),
            lock_state_table: lock::LockStateTable::new(),
        }
    }
}

/// The protocol-state core's central object. One instance per server
/// process; every NFSv4.1 operation handler in `crate::dispatch` and every
/// SMB2 lock/open path goes through it.
pub struct StateManager {
    mu: tokio::sync::RwLock<Inner>,
    lock_mgr: LockManager,
    delegations: tokio::sync::RwLock<DelegationEngine>,
    backchannel: BackchannelRegistry,
    connections: ConnectionBinding,
    counters: Arc<Counters>,
    cfg: Config,
    next_client_id: AtomicU64,
    started_at: Instant,
}

impl StateManager {
    pub fn new(cfg: Config) -> Arc<Self> {
        let counters = Arc::new(Counters::new());
        Arc::new(StateManager {
            mu: tokio::sync::RwLock::new(Inner::new()),
            lock_mgr: LockManager::new(),
            delegations: tokio::sync::RwLock::new(DelegationEngine::new(&cfg, counters.clone())),
            backchannel: BackchannelRegistry::new(),
            connections: ConnectionBinding::new(),
            counters,
            cfg,
            next_client_id: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    /// Whether the server is still within its post-restart grace window
    /// (spec §4.5): during grace, only `reclaim` locks are admitted.
    pub fn in_grace_period(&self, now: Instant) -> bool {
        now < self.started_at + self.cfg.grace_period()
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn connections(&self) -> &ConnectionBinding {
        &self.connections
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_mgr
    }

    // ---- Client Registry (component C, spec §3.1) ----

    /// `EXCHANGE_ID`: finds an existing v4.1 client by `owner_id` (a reboot
    /// with a changed verifier creates a fresh record, per RFC 8881) or
    /// creates one.
    pub async fn exchange_id(&self, owner_id: Vec<u8>, verifier: [u8; 8]) -> ClientId {
        let mut inner = self.mu.write().await;
        if let Some(existing) = inner
            .clients
            .values()
            .find(|c| c.variant == ClientVariant::V41 && c.owner_id == owner_id && c.verifier == verifier)
        {
            return existing.client_id;
        }
        // A co_ownerid match with a different verifier means the client
        // rebooted; its old record (and everything cascading from it) is
        // replaced rather than left to linger until lease expiry.
        let stale: Vec<ClientId> = inner
            .clients
            .values()
            .filter(|c| c.variant == ClientVariant::V41 && c.owner_id == owner_id)
            .map(|c| c.client_id)
            .collect();
        drop(inner);
        for id in stale {
            self.destroy_client(id).await;
        }

        let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let client = Client::new(client_id, ClientVariant::V41, owner_id, verifier, now, self.cfg.lease_duration());
        self.mu.write().await.clients.insert(client_id, client);
        info!(client_id = client_id.0, "EXCHANGE_ID created new client record");
        client_id
    }

    /// `SETCLIENTID` (spec §3.1, v4.0): re-sending the same co_owner/verifier
    /// before confirmation just re-issues the same confirm verifier; any
    /// other case mints a fresh pending (unconfirmed) client record. The
    /// prior confirmed incarnation, if any, is only torn down once
    /// `setclientid_confirm` succeeds against the new record.
    pub async fn setclientid(
        &self,
        owner_id: Vec<u8>,
        verifier: [u8; 8],
        callback_program: Option<CallbackProgram>,
    ) -> (ClientId, [u8; 8]) {
        {
            let inner = self.mu.read().await;
            if let Some(existing) = inner.clients.values().find(|c| {
                c.variant == ClientVariant::V40 && !c.confirmed && c.owner_id == owner_id && c.verifier == verifier
            }) {
                if let Some(confirm_verifier) = existing.confirm_verifier {
                    return (existing.client_id, confirm_verifier);
                }
            }
        }

        let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let confirm_verifier = derive_confirm_verifier(client_id, &verifier);
        let now = Instant::now();
        let mut client = Client::new(client_id, ClientVariant::V40, owner_id, verifier, now, self.cfg.lease_duration());
        client.callback_program = callback_program;
        client.confirm_verifier = Some(confirm_verifier);
        self.mu.write().await.clients.insert(client_id, client);
        info!(client_id = client_id.0, "SETCLIENTID created pending v4.0 client record");
        (client_id, confirm_verifier)
    }

    /// `SETCLIENTID_CONFIRM` (spec §3.1, v4.0): on success, cascades teardown
    /// of any other v4.0 record sharing the same co_owner (the reboot case),
    /// mirroring `exchange_id`'s treatment of v4.1 reboots.
    pub async fn setclientid_confirm(&self, client_id: ClientId, confirm_verifier: [u8; 8]) -> NfsResult<()> {
        let owner_id = {
            let mut inner = self.mu.write().await;
            let client = inner.clients.get_mut(&client_id).ok_or(NfsError::StaleClientId)?;
            if client.variant != ClientVariant::V40 || client.confirm_verifier != Some(confirm_verifier) {
                return Err(NfsError::StaleClientId);
            }
            let first_confirm = !client.confirmed;
            client.confirm();
            if first_confirm {
                client.renew_lease(Instant::now(), self.cfg.lease_duration());
            }
            client.owner_id.clone()
        };

        let stale: Vec<ClientId> = {
            let inner = self.mu.read().await;
            inner
                .clients
                .values()
                .filter(|c| c.variant == ClientVariant::V40 && c.client_id != client_id && c.owner_id == owner_id)
                .map(|c| c.client_id)
                .collect()
        };
        for id in stale {
            self.destroy_client(id).await;
        }
        info!(client_id = client_id.0, "SETCLIENTID_CONFIRM confirmed v4.0 client");
        Ok(())
    }

    /// `RENEW` (spec §4.2, v4.0 only): extends the lease without the
    /// per-op renewal v4.1 gets implicitly through SEQUENCE.
    pub async fn renew(&self, client_id: ClientId) -> NfsResult<()> {
        let mut inner = self.mu.write().await;
        let client = inner.clients.get_mut(&client_id).ok_or(NfsError::StaleClientId)?;
        if client.variant != ClientVariant::V40 || !client.confirmed {
            return Err(NfsError::StaleClientId);
        }
        client.renew_lease(Instant::now(), self.cfg.lease_duration());
        Ok(())
    }

    /// `CREATE_SESSION` (spec §4.2): implements the four-case sequence-id
    /// algorithm. `encode_reply` is called only on the path that actually
    /// executes (case 3) and must return the bytes to cache for replay.
    pub async fn create_session(
        &self,
        client_id: ClientId,
        seq: u32,
        requested_fore: ChannelAttrs,
        requested_back: ChannelAttrs,
        back_chan_requested: bool,
        encode_reply: impl FnOnce(SessionId, &ChannelAttrs, &ChannelAttrs) -> Vec<u8>,
    ) -> NfsResult<(SessionId, ChannelAttrs, ChannelAttrs, Vec<u8>)> {
        let mut inner = self.mu.write().await;
        let client = inner.clients.get_mut(&client_id).ok_or(NfsError::StaleClientId)?;

        if seq == client.sequence_id {
            if let Some(cached) = &client.cached_create_session_reply {
                self.counters.slot_replay_hit();
                // The caller already holds the session id from its first
                // successful CREATE_SESSION; only the cached bytes matter
                // for a replay, so the placeholder id here is never used.
                return Ok((SessionId::new_random(client_id, seq), requested_fore, requested_back, cached.clone()));
            }
        }
        if seq != client.sequence_id.wrapping_add(1) {
            return Err(NfsError::SeqMisordered);
        }

        let session_count = inner.sessions.values().filter(|s| s.client_id == client_id).count();
        if session_count >= self.cfg.session_cap_per_client {
            return Err(NfsError::Resource);
        }

        let fore_attrs = ChannelAttrs::negotiate_fore(&self.cfg, &requested_fore);
        let back_attrs = ChannelAttrs::negotiate_back(&self.cfg, &requested_back);
        let now = Instant::now();
        let session_id = SessionId::new_random(client_id, seq);
        let session = Session::new(session_id, client_id, fore_attrs, back_attrs, back_chan_requested, now);
        inner.sessions.insert(session_id, session);

        let client = inner.clients.get_mut(&client_id).unwrap();
        let reply_bytes = encode_reply(session_id, &fore_attrs, &back_attrs);
        client.sequence_id = client.sequence_id.wrapping_add(1);
        client.cached_create_session_reply = Some(reply_bytes.clone());
        client.sessions.push(session_id);
        let first_confirm = !client.confirmed;
        client.confirm();
        if first_confirm {
            client.renew_lease(now, self.cfg.lease_duration());
        }

        self.counters.session_created();
        info!(client_id = client_id.0, session_id = %session_id, "session created");
        Ok((session_id, fore_attrs, back_attrs, reply_bytes))
    }

    /// `DESTROY_SESSION` (spec §4.2): `DELAY` while any fore-channel slot is
    /// in use.
    pub async fn destroy_session(&self, session_id: SessionId) -> NfsResult<()> {
        let mut inner = self.mu.write().await;
        let session = inner.sessions.get(&session_id).ok_or(NfsError::BadSession)?;
        if session.fore_channel.any_in_use() {
            return Err(NfsError::Delay);
        }
        let duration_ms = session.age(Instant::now()).as_millis() as u64;
        let client_id = session.client_id;
        inner.sessions.remove(&session_id);
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.sessions.retain(|s| *s != session_id);
        }
        drop(inner);

        self.backchannel.unregister(session_id, client_id);
        self.connections.drop_session(session_id).await;
        self.counters.session_destroyed(duration_ms);
        info!(session_id = %session_id, "session destroyed");
        Ok(())
    }

    pub async fn list_sessions(&self, client_id: ClientId) -> Vec<SessionId> {
        self.mu.read().await.sessions.values().filter(|s| s.client_id == client_id).map(|s| s.session_id).collect()
    }

    pub async fn force_destroy_session(&self, session_id: SessionId) {
        let mut inner = self.mu.write().await;
        if let Some(session) = inner.sessions.remove(&session_id) {
            if let Some(client) = inner.clients.get_mut(&session.client_id) {
                client.sessions.retain(|s| *s != session_id);
            }
        }
        drop(inner);
        self.backchannel.unregister(session_id, ClientId(0));
        self.connections.drop_session(session_id).await;
    }

    /// `BIND_CONN_TO_SESSION` (spec §4.9).
    pub async fn bind_conn_to_session(
        &self,
        conn_id: crate::connection::ConnId,
        session_id: SessionId,
        direction: ConnDirection,
    ) -> NfsResult<()> {
        if !self.mu.read().await.sessions.contains_key(&session_id) {
            return Err(NfsError::BadSession);
        }
        let dir = match direction {
            ConnDirection::Fore => crate::connection::Direction::Fore,
            ConnDirection::Back => crate::connection::Direction::Back,
            ConnDirection::Both => crate::connection::Direction::Both,
        };
        self.connections.bind(conn_id, session_id, dir).await;
        Ok(())
    }

    /// Lazily spawns a `backchannel::Sender` task for `session_id` the
    /// first time a back-bound connection registers a writer (spec §4.9).
    pub async fn ensure_backchannel_sender(&self, session_id: SessionId) -> NfsResult<Arc<BackchannelSender>> {
        if let Some(existing) = self.backchannel.sender_for_session(session_id) {
            return Ok(existing);
        }
        let mut inner = self.mu.write().await;
        let session = inner.sessions.get_mut(&session_id).ok_or(NfsError::BadSession)?;
        let client_id = session.client_id;
        session.back_sender_bound = true;
        drop(inner);

        let sender = BackchannelSender::new(session_id, client_id, &self.cfg, self.counters.clone());
        self.backchannel.register(sender.clone());
        tokio::spawn(sender.clone().run());
        Ok(sender)
    }

    /// Lazy back-channel writer registration (spec §4.9): called by the
    /// connection handler after any successful COMPOUND on a connection
    /// whose session requested `CREATE_SESSION4_FLAG_CONN_BACK_CHAN`. Wires
    /// `ConnectionBinding`'s selection straight into the session's
    /// `backchannel::Sender`, so the sender has an actual writer to send
    /// CB_RECALL/CB_NOTIFY through instead of only a list of candidates.
    pub async fn register_conn_writer(
        &self,
        session_id: SessionId,
        conn_id: crate::connection::ConnId,
        writer: crate::backchannel::ConnWriter,
    ) -> NfsResult<()> {
        let wants_back_chan = self
            .mu
            .read()
            .await
            .sessions
            .get(&session_id)
            .ok_or(NfsError::BadSession)?
            .back_chan_requested;
        if !wants_back_chan {
            return Ok(());
        }
        self.connections.register_conn_writer(session_id, conn_id, writer).await;
        let sender = self.ensure_backchannel_sender(session_id).await?;
        if let Some(selected) = self.connections.select_writer(session_id).await {
            sender.set_writer(selected).await;
        }
        Ok(())
    }

    /// On disconnect: drops `conn_id` as a back-channel candidate and, if it
    /// was the session's currently selected writer, lets the next send pick
    /// a surviving candidate (spec §4.9).
    pub async fn unregister_conn(&self, session_id: SessionId, conn_id: crate::connection::ConnId) {
        self.connections.unregister(session_id, conn_id).await;
        if let Some(sender) = self.backchannel.sender_for_session(session_id) {
            let reselected = self.connections.select_writer(session_id).await;
            match reselected {
                Some(writer) => sender.set_writer(writer).await,
                None => sender.clear_writer_if(|_| true).await,
            }
        }
    }

    /// Runs `f` against the fore-channel slot `slot_id` of `session_id`,
    /// holding `mu` only for the duration of the closure (spec §5 lock
    /// hierarchy: never held across a dispatcher's op execution).
    pub async fn with_fore_slot<T>(
        &self,
        session_id: SessionId,
        slot_id: u32,
        f: impl FnOnce(&mut crate::session::slot::Slot) -> NfsResult<T>,
    ) -> NfsResult<T> {
        let mut inner = self.mu.write().await;
        let session = inner.sessions.get_mut(&session_id).ok_or(NfsError::BadSession)?;
        let slot = session.fore_channel.slot_mut(slot_id)?;
        f(slot)
    }

    // ---- Session reaper (spec §4.2) ----

    /// Spawns the single reaper task; ticks every `cfg.reaper_interval`.
    pub fn start_session_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sm = self.clone();
        let interval = self.cfg.reaper_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sm.reap_once(Instant::now()).await;
            }
        })
    }

    /// One reaper sweep: expired leases cascade-destroy every resource
    /// referencing the client (spec §4.2, §7 atomicity invariant); stale
    /// unconfirmed clients are reaped too.
    pub async fn reap_once(&self, now: Instant) {
        let expired: Vec<ClientId> = {
            let inner = self.mu.read().await;
            inner
                .clients
                .values()
                .filter(|c| {
                    (c.confirmed && c.is_lease_expired(now)) || c.is_stale_unconfirmed(now, self.cfg.lease_duration())
                })
                .map(|c| c.client_id)
                .collect()
        };
        for client_id in expired {
            warn!(client_id = client_id.0, "lease expired or client stale, reaping");
            self.destroy_client(client_id).await;
        }

        let expired_delegs = {
            let mut delegations = self.delegations.write().await;
            delegations.revoke_expired(now)
        };
        if !expired_delegs.is_empty() {
            debug!(count = expired_delegs.len(), "delegations revoked after recall deadline");
        }

        self.delegations.read().await.flush_expired(now, &self.backchannel).await;
    }

    /// Cascading teardown for one client: sessions, slot tables, lock-manager
    /// entries, delegations, open-states, lock-states — all together
    /// (spec §7 lease-cleanup atomicity invariant).
    async fn destroy_client(&self, client_id: ClientId) {
        let sessions: Vec<SessionId> = {
            let mut inner = self.mu.write().await;
            let sessions: Vec<SessionId> =
                inner.sessions.values().filter(|s| s.client_id == client_id).map(|s| s.session_id).collect();
            for sid in &sessions {
                inner.sessions.remove(sid);
            }
            inner.open_table.remove_all_for_client(client_id);
            inner.lock_state_table.remove_all_for_client(client_id);
            inner.clients.remove(&client_id);
            sessions
        };
        for sid in &sessions {
            self.backchannel.unregister(*sid, client_id);
            self.connections.drop_session(*sid).await;
            self.counters.session_destroyed(0);
        }
        self.lock_mgr.remove_all_for_client(&lock::LockStateTable::namespaced_client_id(client_id)).await;
        self.delegations.write().await.remove_all_for_client(client_id);
    }

    /// `DESTROY_CLIENTID`.
    pub async fn destroy_client_id(&self, client_id: ClientId) -> NfsResult<()> {
        let has_active_session = {
            let inner = self.mu.read().await;
            inner.sessions.values().any(|s| s.client_id == client_id && s.fore_channel.any_in_use())
        };
        if has_active_session {
            return Err(NfsError::Delay);
        }
        self.destroy_client(client_id).await;
        Ok(())
    }

    // ---- OPEN / CLOSE / OPEN_DOWNGRADE (component D, spec §4.4) ----

    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        &self,
        client_id: ClientId,
        owner_bytes: Vec<u8>,
        file_handle: Vec<u8>,
        share_access: u32,
        share_deny: u32,
    ) -> NfsResult<StateId> {
        let mut inner = self.mu.write().await;
        inner.open_table.open(client_id, owner_bytes, file_handle, share_access, share_deny)
    }

    pub async fn close(&self, stateid: StateId) -> NfsResult<()> {
        self.mu.write().await.open_table.close(stateid)
    }

    pub async fn open_downgrade(&self, stateid: StateId, access: u32, deny: u32) -> NfsResult<StateId> {
        self.mu.write().await.open_table.downgrade(stateid, access, deny)
    }

    pub async fn open_state_access(&self, stateid: StateId) -> NfsResult<(u32, u32)> {
        let inner = self.mu.read().await;
        let state = inner.open_table.states.get(&stateid).ok_or(NfsError::BadStateid)?;
        Ok((state.share_access, state.share_deny))
    }

    pub async fn conflicting_write_opens_exist(&self, file_handle: &[u8], excluding: ClientId) -> bool {
        let inner = self.mu.read().await;
        inner
            .open_table
            .states_for_handle(file_handle)
            .iter()
            .any(|s| s.client_id != excluding && s.share_access & open::SHARE_ACCESS_WRITE != 0)
    }

    // ---- LOCK / LOCKT / LOCKU / RELEASE_LOCKOWNER (components E/F, spec §4.5) ----

    /// `LOCK` with `new_lock_owner == true`. Validates the open-state's
    /// share mode grants the requested lock kind before calling the Lock
    /// Manager (spec §4.5 open-mode validation).
    #[allow(clippy::too_many_arguments)]
    pub async fn lock_new_owner(
        &self,
        client_id: ClientId,
        owner_bytes: Vec<u8>,
        open_stateid: StateId,
        file_handle: Vec<u8>,
        offset: u64,
        length: u64,
        kind: LockKind,
        reclaim: bool,
    ) -> Result<StateId, LockError> {
        if !reclaim && self.in_grace_period(Instant::now()) {
            return Err(LockError::Nfs(NfsError::Grace));
        }
        self.validate_open_mode(open_stateid, kind).await?;
        let owner_id = lock::LockStateTable::namespaced_owner_id(client_id, &owner_bytes);
        let entry = LockEntry {
            owner_id: owner_id.clone(),
            client_id: lock::LockStateTable::namespaced_client_id(client_id),
            file_handle: file_handle.clone(),
            offset,
            length,
            kind,
            reclaim,
        };
        self.lock_mgr.add_enhanced_lock(entry).await.map_err(LockError::Conflict)?;
        let mut inner = self.mu.write().await;
        let lock_stateid =
            inner.lock_state_table.create_lock_state(client_id, owner_bytes, open_stateid, file_handle.clone());
        if let Some(open_state) = inner.open_table.states.get_mut(&open_stateid) {
            open_state.lock_states.push(lock_stateid);
        }
        Ok(lock_stateid)
    }

    /// `LOCK` with `new_lock_owner == false`: reuses the existing
    /// lock-state, asking the Lock Manager to add the new range.
    pub async fn lock_existing_owner(
        &self,
        client_id: ClientId,
        owner_bytes: &[u8],
        open_stateid: StateId,
        file_handle: Vec<u8>,
        offset: u64,
        length: u64,
        kind: LockKind,
    ) -> Result<StateId, LockError> {
        // A non-reclaim lock request on an already-known lock-owner is still
        // subject to the grace window (spec §4.5): only the initial
        // new-lock-owner request ever carries `reclaim = true`.
        if self.in_grace_period(Instant::now()) {
            return Err(LockError::Nfs(NfsError::Grace));
        }
        self.validate_open_mode(open_stateid, kind).await?;
        let lock_stateid = {
            let inner = self.mu.read().await;
            inner
                .lock_state_table
                .find_existing(client_id, owner_bytes, &file_handle)
                .ok_or(LockError::Nfs(NfsError::BadStateid))?
        };
        let owner_id = lock::LockStateTable::namespaced_owner_id(client_id, owner_bytes);
        let entry = LockEntry {
            owner_id,
            client_id: lock::LockStateTable::namespaced_client_id(client_id),
            file_handle,
            offset,
            length,
            kind,
            reclaim: false,
        };
        self.lock_mgr.add_enhanced_lock(entry).await.map_err(LockError::Conflict)?;
        Ok(lock_stateid)
    }

    async fn validate_open_mode(&self, open_stateid: StateId, kind: LockKind) -> Result<(), LockError> {
        let (access, _deny) = self.open_state_access(open_stateid).await.map_err(LockError::Nfs)?;
        let needed = match kind {
            LockKind::Exclusive => open::SHARE_ACCESS_WRITE,
            LockKind::Shared => open::SHARE_ACCESS_READ,
        };
        if access & needed == 0 {
            return Err(LockError::Nfs(NfsError::OpenMode));
        }
        Ok(())
    }

    /// `LOCKT`: query only.
    pub async fn lock_test(&self, candidate: LockEntry) -> Option<Conflict> {
        self.lock_mgr.is_conflicting(&candidate).await
    }

    /// `LOCKU` (spec §4.5): idempotent; does not remove the lock-state.
    pub async fn lock_unlock(&self, owner_id: &str, file_handle: &[u8], offset: u64, length: u64) {
        self.lock_mgr.remove_enhanced_lock(owner_id, file_handle, offset, length).await;
    }

    /// `RELEASE_LOCKOWNER`: fails with `LOCKS_HELD` if any range remains
    /// under the owner in the Lock Manager (spec §4.5).
    pub async fn release_lock_owner(&self, client_id: ClientId, owner_bytes: &[u8]) -> NfsResult<()> {
        let owner_id = lock::LockStateTable::namespaced_owner_id(client_id, owner_bytes);
        let handles: Vec<Vec<u8>> = {
            let inner = self.mu.read().await;
            inner
                .lock_state_table
                .states
                .values()
                .filter(|s| s.owner_key.client_id == client_id)
                .map(|s| s.file_handle.clone())
                .collect()
        };
        for handle in &handles {
            let held = self.lock_mgr.list_enhanced_locks(handle).await;
            if held.iter().any(|e| e.owner_id == owner_id) {
                return Err(NfsError::LocksHeld);
            }
        }
        self.mu.write().await.lock_state_table.release_owner(client_id, owner_bytes)
    }

    // ---- Delegation Engine (component G, spec §4.6) ----

    pub async fn try_grant_file_read_delegation(
        &self,
        client_id: ClientId,
        file_handle: Vec<u8>,
    ) -> Option<StateId> {
        let conflicting = self.conflicting_write_opens_exist(&file_handle, client_id).await;
        let back_bound = self.backchannel.has_sender_for(client_id);
        self.delegations.write().await.try_grant_file_read(client_id, file_handle, conflicting, back_bound)
    }

    pub async fn try_grant_directory_delegation(
        &self,
        client_id: ClientId,
        dir_handle: Vec<u8>,
        notification_mask: u32,
    ) -> Option<StateId> {
        let back_bound = self.backchannel.has_sender_for(client_id);
        self.delegations.write().await.try_grant_directory(client_id, dir_handle, notification_mask, back_bound)
    }

    /// Triggers a recall for every delegation holder on `file_handle`
    /// except `requesting_client` (spec §4.6).
    pub async fn recall_conflicting(&self, file_handle: &[u8], requesting_client: ClientId, reason: &str) {
        let holders = self.delegations.read().await.holders_for_handle(file_handle);
        let lease = self.cfg.lease_duration();
        let mut delegations = self.delegations.write().await;
        for holder in holders {
            if holder.client_id != requesting_client && !holder.revoked && !holder.recall_sent {
                delegations.recall(holder.stateid, reason, lease, &self.backchannel);
            }
        }
    }

    pub async fn delegreturn(&self, stateid: StateId) -> bool {
        self.delegations.write().await.delegreturn(stateid)
    }

    /// Directory deletion while delegated: immediate revocation (spec §4.6).
    pub async fn revoke_directory(&self, dir_handle: &[u8]) {
        self.delegations.write().await.revoke_directory(dir_handle);
    }

    /// Directory-mutating operations call this after the metadata-store
    /// mutation succeeds (spec §4.4, §4.6).
    pub async fn notify_dir_change(&self, dir_handle: &[u8], event: NotifyEvent) {
        self.delegations.read().await.notify_dir_change(dir_handle, event, &self.backchannel).await;
    }

    pub fn callback_sink(&self) -> &dyn CallbackSink {
        &self.backchannel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    Nfs(NfsError),
    Conflict(Conflict),
}

impl From<NfsError> for LockError {
    fn from(value: NfsError) -> Self {
        LockError::Nfs(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelAttrs;

    fn attrs() -> ChannelAttrs {
        ChannelAttrs {
            max_requests: 8,
            max_request_size: 65536,
            max_response_size: 65536,
            max_response_size_cached: 8192,
            max_operations: 8,
        }
    }

    #[tokio::test]
    async fn create_session_increments_client_sequence() {
        let sm = StateManager::new(Config::default());
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let (_sid, _fore, _back, _bytes) = sm
            .create_session(client_id, 1, attrs(), attrs(), false, |_, _, _| b"reply1".to_vec())
            .await
            .unwrap();
        let err = sm.create_session(client_id, 1, attrs(), attrs(), false, |_, _, _| b"reply2".to_vec()).await;
        // Same seq replays rather than re-executing (case 2).
        assert!(err.is_ok());
    }

    #[tokio::test]
    async fn create_session_rejects_misordered_seq() {
        let sm = StateManager::new(Config::default());
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let err = sm.create_session(client_id, 5, attrs(), attrs(), false, |_, _, _| vec![]).await.unwrap_err();
        assert_eq!(err, NfsError::SeqMisordered);
    }

    #[tokio::test]
    async fn session_cap_per_client_enforced() {
        let mut cfg = Config::default();
        cfg.session_cap_per_client = 1;
        let sm = StateManager::new(cfg);
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        sm.create_session(client_id, 1, attrs(), attrs(), false, |_, _, _| vec![1]).await.unwrap();
        let err = sm.create_session(client_id, 2, attrs(), attrs(), false, |_, _, _| vec![2]).await.unwrap_err();
        assert_eq!(err, NfsError::Resource);
    }

    #[tokio::test]
    async fn lease_expiry_cascades_open_and_lock_state() {
        let mut cfg = Config::default();
        cfg.lease_duration_secs = 0;
        let sm = StateManager::new(cfg);
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        sm.create_session(client_id, 1, attrs(), attrs(), false, |_, _, _| vec![]).await.unwrap();
        sm.open(client_id, b"o".to_vec(), b"/a".to_vec(), open::SHARE_ACCESS_READ, open::SHARE_DENY_NONE)
            .await
            .unwrap();
        sm.reap_once(Instant::now() + std::time::Duration::from_millis(1)).await;
        assert!(sm.mu.read().await.open_table.states.is_empty());
        assert!(sm.mu.read().await.clients.is_empty());
    }

    #[tokio::test]
    async fn close_without_locks_succeeds() {
        let sm = StateManager::new(Config::default());
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let stateid = sm
            .open(client_id, b"o".to_vec(), b"/a".to_vec(), open::SHARE_ACCESS_WRITE, open::SHARE_DENY_NONE)
            .await
            .unwrap();
        sm.close(stateid).await.unwrap();
    }

    #[tokio::test]
    async fn grace_period_admits_only_reclaim_locks() {
        let mut cfg = Config::default();
        cfg.grace_period_secs = 3600;
        let sm = StateManager::new(cfg);
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let open_id = sm
            .open(client_id, b"o".to_vec(), b"/a".to_vec(), open::SHARE_ACCESS_WRITE, open::SHARE_DENY_NONE)
            .await
            .unwrap();
        let err = sm
            .lock_new_owner(client_id, b"lo".to_vec(), open_id, b"/a".to_vec(), 0, 100, LockKind::Exclusive, false)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Nfs(NfsError::Grace));

        sm.lock_new_owner(client_id, b"lo".to_vec(), open_id, b"/a".to_vec(), 0, 100, LockKind::Exclusive, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_requires_matching_open_mode() {
        let mut cfg = Config::default();
        cfg.grace_period_secs = 0;
        let sm = StateManager::new(cfg);
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let open_id = sm
            .open(client_id, b"o".to_vec(), b"/a".to_vec(), open::SHARE_ACCESS_READ, open::SHARE_DENY_NONE)
            .await
            .unwrap();
        let err = sm
            .lock_new_owner(client_id, b"lo".to_vec(), open_id, b"/a".to_vec(), 0, 100, LockKind::Exclusive, false)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Nfs(NfsError::OpenMode));
    }

    #[tokio::test]
    async fn setclientid_then_confirm_establishes_a_v40_client() {
        let sm = StateManager::new(Config::default());
        let (client_id, confirm_verifier) = sm.setclientid(b"owner".to_vec(), [9; 8], None).await;
        sm.setclientid_confirm(client_id, confirm_verifier).await.unwrap();
        assert!(sm.renew(client_id).await.is_ok());
    }

    #[tokio::test]
    async fn setclientid_confirm_rejects_wrong_verifier() {
        let sm = StateManager::new(Config::default());
        let (client_id, _) = sm.setclientid(b"owner".to_vec(), [9; 8], None).await;
        let err = sm.setclientid_confirm(client_id, [0; 8]).await.unwrap_err();
        assert_eq!(err, NfsError::StaleClientId);
    }

    #[tokio::test]
    async fn renew_rejects_unconfirmed_v40_client() {
        let sm = StateManager::new(Config::default());
        let (client_id, _) = sm.setclientid(b"owner".to_vec(), [9; 8], None).await;
        let err = sm.renew(client_id).await.unwrap_err();
        assert_eq!(err, NfsError::StaleClientId);
    }

    #[tokio::test]
    async fn reconfirming_same_owner_tears_down_the_prior_v40_record() {
        let sm = StateManager::new(Config::default());
        let (first_id, first_confirm) = sm.setclientid(b"owner".to_vec(), [1; 8], None).await;
        sm.setclientid_confirm(first_id, first_confirm).await.unwrap();
        sm.open(first_id, b"o".to_vec(), b"/a".to_vec(), open::SHARE_ACCESS_READ, open::SHARE_DENY_NONE)
            .await
            .unwrap();

        let (second_id, second_confirm) = sm.setclientid(b"owner".to_vec(), [2; 8], None).await;
        sm.setclientid_confirm(second_id, second_confirm).await.unwrap();

        assert!(sm.renew(first_id).await.is_err());
        assert!(sm.mu.read().await.clients.contains_key(&second_id));
    }
}
