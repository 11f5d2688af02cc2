//! Observable counters for test harnesses (spec §6.5).
//!
//! Plain atomics plus a small fixed-bucket histogram — no external metrics
//! crate, since this surface is internal-only and the teacher project does
//! not carry one either.

use std::sync::atomic::{AtomicU64, Ordering};

const HIST_BUCKETS: usize = 16;

/// Bucketed counts of observed durations in milliseconds, doubling per
/// bucket starting at 1ms (bucket 15 is the overflow bucket).
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; HIST_BUCKETS],
}

impl Histogram {
    pub fn new() -> Self {
        Self { buckets: Default::default() }
    }

    pub fn record(&self, millis: u64) {
        let mut bucket = 0;
        let mut threshold = 1u64;
        while bucket < HIST_BUCKETS - 1 && millis >= threshold {
            threshold *= 2;
            bucket += 1;
        }
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_counts(&self) -> [u64; HIST_BUCKETS] {
        let mut out = [0u64; HIST_BUCKETS];
        for (o, b) in out.iter_mut().zip(self.buckets.iter()) {
            *o = b.load(Ordering::Relaxed);
        }
        out
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    File,
    Directory,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub sessions_created: AtomicU64,
    pub sessions_destroyed: AtomicU64,
    pub sessions_active: AtomicU64,
    pub session_duration: Histogram,

    pub slot_replay_hits: AtomicU64,

    pub delegations_granted_file: AtomicU64,
    pub delegations_granted_dir: AtomicU64,
    pub delegations_recalled_file: AtomicU64,
    pub delegations_recalled_dir: AtomicU64,
    pub delegations_revoked_file: AtomicU64,
    pub delegations_revoked_dir: AtomicU64,

    pub callbacks_total: AtomicU64,
    pub callbacks_failed: AtomicU64,
    pub callback_duration: Histogram,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_destroyed(&self, duration_millis: u64) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.session_duration.record(duration_millis);
    }

    pub fn slot_replay_hit(&self) {
        self.slot_replay_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delegation_granted(&self, kind: DelegationKind) {
        match kind {
            DelegationKind::File => self.delegations_granted_file.fetch_add(1, Ordering::Relaxed),
            DelegationKind::Directory => self.delegations_granted_dir.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn delegation_recalled(&self, kind: DelegationKind) {
        match kind {
            DelegationKind::File => self.delegations_recalled_file.fetch_add(1, Ordering::Relaxed),
            DelegationKind::Directory => self.delegations_recalled_dir.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn delegation_revoked(&self, kind: DelegationKind) {
        match kind {
            DelegationKind::File => self.delegations_revoked_file.fetch_add(1, Ordering::Relaxed),
            DelegationKind::Directory => self.delegations_revoked_dir.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn callback_completed(&self, duration_millis: u64, failed: bool) {
        self.callbacks_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.callback_duration.record(duration_millis);
    }
}
