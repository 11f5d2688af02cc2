//! Exactly-once-semantics replay (spec §4.3 step 2, §4.9 slot tables): a
//! retransmitted SEQUENCE with the same slot/seqid must return the cached
//! reply bytes without re-running the compound's ops.

use super::common::{ip, noop_encode, Fixture};
use dittofs_core::dispatch::{Compound, Op};
use dittofs_core::state::open::{SHARE_ACCESS_WRITE, SHARE_DENY_NONE};

#[tokio::test]
async fn retransmitted_open_replays_without_reopening() {
    let fx = Fixture::new();
    let (client_id, session_id) = fx.bootstrap_session(b"eos-client").await;
    fx.store.create_file(super::common::memstore::ROOT, "f.txt", 0o644).await.unwrap();

    let compound = Compound {
        tag: "open".into(),
        minor_version: 1,
        ops: vec![
            Op::Sequence { session_id, slot_id: 0, seqid: 1, cache_this: true },
            Op::PutFh { file_handle: b"/f.txt".to_vec() },
            Op::Open {
                client_id,
                owner: b"owner-a".to_vec(),
                share_access: SHARE_ACCESS_WRITE,
                share_deny: SHARE_DENY_NONE,
                create: false,
                name: "f.txt".into(),
            },
        ],
    };

    let first = fx.dispatcher.execute(compound.clone(), ip(), noop_encode).await;
    let replay = fx.dispatcher.execute(compound, ip(), noop_encode).await;
    assert_eq!(first, replay);
}

#[tokio::test]
async fn advancing_seqid_on_the_same_slot_is_accepted() {
    let fx = Fixture::new();
    let (_, session_id) = fx.bootstrap_session(b"eos-client-2").await;

    let first = Compound {
        tag: "getattr-1".into(),
        minor_version: 1,
        ops: vec![Op::Sequence { session_id, slot_id: 0, seqid: 1, cache_this: true }, Op::PutFh { file_handle: b"/a".to_vec() }, Op::GetAttr],
    };
    let second = Compound {
        tag: "getattr-2".into(),
        minor_version: 1,
        ops: vec![Op::Sequence { session_id, slot_id: 0, seqid: 2, cache_this: true }, Op::PutFh { file_handle: b"/b".to_vec() }, Op::GetAttr],
    };

    let first_bytes = fx.dispatcher.execute(first, ip(), noop_encode).await;
    let second_bytes = fx.dispatcher.execute(second, ip(), noop_encode).await;
    assert_eq!(first_bytes, vec![1, 1, 1]);
    assert_eq!(second_bytes, vec![1, 1, 1]);
}
