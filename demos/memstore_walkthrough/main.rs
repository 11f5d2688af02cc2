//! Walks a client through EXCHANGE_ID, CREATE_SESSION, OPEN, a buffered
//! write through the cache, a flusher sweep, and CLOSE against the
//! in-memory demo store (spec §6.6). Not a production server entry point —
//! transport, XDR encoding, and the control plane are all out of scope.

use dittofs_core::cache::{Cache, State as CacheState};
use dittofs_core::config::Config;
use dittofs_core::dispatch::{Compound, CompoundReply, Dispatcher, Op};
use dittofs_core::flusher;
use dittofs_core::session::ChannelAttrs;
use dittofs_core::state::StateManager;
use dittofs_core::store::{ContentStore, IncrementalWriteStore, MetadataStore};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[path = "../memstore/mod.rs"]
mod memstore;

fn attrs() -> ChannelAttrs {
    ChannelAttrs { max_requests: 8, max_request_size: 65536, max_response_size: 65536, max_response_size_cached: 8192, max_operations: 8 }
}

fn noop_encode(reply: &CompoundReply) -> Vec<u8> {
    reply.results.iter().map(|(_, r)| if r.is_ok() { 1u8 } else { 0u8 }).collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let store = Arc::new(memstore::MemStore::new());
    let file = store.create_file(memstore::ROOT, "greeting.txt", 0o644).await.unwrap();
    let content_id = store.content_id_of(file).await.unwrap();

    let state = StateManager::new(Config::default());
    let dispatcher = Dispatcher::new(state.clone());
    let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let client_id = state.exchange_id(b"memstore-walkthrough".to_vec(), [7; 8]).await;
    let create_session = Compound {
        tag: "create-session".into(),
        minor_version: 1,
        ops: vec![Op::CreateSession { client_id, seqid: 1, fore: attrs(), back: attrs(), want_back_chan: false }],
    };
    dispatcher.execute(create_session, ip, noop_encode).await;
    let session_id = state.list_sessions(client_id).await[0];
    println!("session established: {session_id:?}");

    let open = Compound {
        tag: "open".into(),
        minor_version: 1,
        ops: vec![
            Op::Sequence { session_id, slot_id: 0, seqid: 1, cache_this: false },
            Op::PutFh { file_handle: b"/".to_vec() },
            Op::Open {
                client_id,
                owner: b"owner-1".to_vec(),
                share_access: dittofs_core::state::open::SHARE_ACCESS_WRITE,
                share_deny: dittofs_core::state::open::SHARE_DENY_NONE,
                create: false,
                name: "greeting.txt".into(),
            },
        ],
    };
    dispatcher.execute(open, ip, noop_encode).await;
    println!("opened greeting.txt for writing");

    let cache = Arc::new(Cache::new(64 * 1024 * 1024, 4 * 1024 * 1024, 4));
    cache.write_at(content_id, 0, b"hello from the write-path cache").await;
    cache.set_state(content_id, CacheState::Uploading).await;
    store.begin_incremental_write(content_id).await.unwrap();

    let incremental_store: Arc<dyn IncrementalWriteStore> = store.clone();
    flusher::sweep_once(&cache, &incremental_store, std::time::Duration::from_secs(0)).await;

    let size = store.get_content_size(content_id).await.unwrap();
    println!("flusher drained {size} bytes into the content store");
}
