//! Black-box scenario tests against the protocol-state core, one file per
//! component pairing, mirroring the teacher's `tests/shadow_fs/` layout.

mod common;
mod cache_coverage;
mod delegation_recall;
mod eos_replay;
mod flusher_timing;
