//! Conflicting write open recalls an outstanding read delegation (spec
//! §4.6): a directory-mutation-free variant of the same path, this one
//! driven entirely through `Dispatcher::execute` rather than calling
//! `StateManager` methods directly.

use super::common::{ip, noop_encode, Fixture};
use dittofs_core::dispatch::{Compound, Op};
use dittofs_core::state::open::{SHARE_ACCESS_READ, SHARE_ACCESS_WRITE, SHARE_DENY_NONE};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn conflicting_write_open_recalls_read_delegation() {
    let fx = Fixture::new();
    fx.store.create_file(super::common::memstore::ROOT, "shared.txt", 0o644).await.unwrap();

    let (reader_id, reader_session) = fx.bootstrap_session(b"reader").await;
    let (writer_id, writer_session) = fx.bootstrap_session(b"writer").await;

    // The reader needs a bound back channel before a read delegation can be
    // granted (spec §4.6 granting policy), so bootstrap_session's
    // `want_back_chan: true` must also register a sender.
    fx.state.ensure_backchannel_sender(reader_session).await.unwrap();

    let open_read = Compound {
        tag: "open-read".into(),
        minor_version: 1,
        ops: vec![
            Op::Sequence { session_id: reader_session, slot_id: 0, seqid: 1, cache_this: false },
            Op::PutFh { file_handle: b"/shared.txt".to_vec() },
            Op::Open {
                client_id: reader_id,
                owner: b"reader-owner".to_vec(),
                share_access: SHARE_ACCESS_READ,
                share_deny: SHARE_DENY_NONE,
                create: false,
                name: "shared.txt".into(),
            },
        ],
    };
    fx.dispatcher.execute(open_read, ip(), noop_encode).await;

    let granted = fx.state.try_grant_file_read_delegation(reader_id, b"/shared.txt".to_vec()).await;
    assert!(granted.is_some(), "read delegation should be granted with no conflicting write opens and a bound back channel");

    let before = fx.state.counters().delegations_recalled_file.load(Ordering::Relaxed);

    let open_write = Compound {
        tag: "open-write".into(),
        minor_version: 1,
        ops: vec![
            Op::Sequence { session_id: writer_session, slot_id: 0, seqid: 1, cache_this: false },
            Op::PutFh { file_handle: b"/shared.txt".to_vec() },
            Op::Open {
                client_id: writer_id,
                owner: b"writer-owner".to_vec(),
                share_access: SHARE_ACCESS_WRITE,
                share_deny: SHARE_DENY_NONE,
                create: false,
                name: "shared.txt".into(),
            },
        ],
    };
    fx.dispatcher.execute(open_write, ip(), noop_encode).await;

    let after = fx.state.counters().delegations_recalled_file.load(Ordering::Relaxed);
    assert_eq!(after, before + 1);
}
