//! Shared fixture for the scenario tests in this file (teacher's
//! `tests/shadow_fs/common.rs` pattern): wires a fresh `StateManager` and
//! `Dispatcher` to the in-memory demo store and a write-path cache, with a
//! `bootstrap_session` helper mirroring `dispatch.rs`'s own test module.

use dittofs_core::cache::Cache;
use dittofs_core::client::ClientId;
use dittofs_core::config::Config;
use dittofs_core::dispatch::{Compound, CompoundReply, Dispatcher, Op};
use dittofs_core::session::{ChannelAttrs, SessionId};
use dittofs_core::state::StateManager;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[path = "../../demos/memstore/mod.rs"]
pub mod memstore;

pub fn ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

pub fn attrs() -> ChannelAttrs {
    ChannelAttrs { max_requests: 8, max_request_size: 65536, max_response_size: 65536, max_response_size_cached: 8192, max_operations: 8 }
}

pub fn noop_encode(reply: &CompoundReply) -> Vec<u8> {
    reply.results.iter().map(|(_, r)| if r.is_ok() { 1u8 } else { 0u8 }).collect()
}

pub struct Fixture {
    pub state: Arc<StateManager>,
    pub dispatcher: Dispatcher,
    pub store: Arc<memstore::MemStore>,
    pub cache: Arc<Cache>,
}

impl Fixture {
    pub fn new() -> Self {
        let mut cfg = Config::default();
        cfg.grace_period_secs = 0;
        let state = StateManager::new(cfg);
        let dispatcher = Dispatcher::new(state.clone());
        Fixture { state, dispatcher, store: Arc::new(memstore::MemStore::new()), cache: Arc::new(Cache::new(64 * 1024 * 1024, 4 * 1024 * 1024, 4)) }
    }

    pub async fn bootstrap_session(&self, owner: &[u8]) -> (ClientId, SessionId) {
        let client_id = self.state.exchange_id(owner.to_vec(), [0; 8]).await;
        let compound = Compound {
            tag: "create".into(),
            minor_version: 1,
            ops: vec![Op::CreateSession { client_id, seqid: 1, fore: attrs(), back: attrs(), want_back_chan: true }],
        };
        let _ = self.dispatcher.execute(compound, ip(), noop_encode).await;
        let session_id = self.state.list_sessions(client_id).await[0];
        (client_id, session_id)
    }
}
