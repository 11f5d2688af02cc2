//! Slot Table & EOS (spec §2.A, §3.3, §4.1).

use crate::error::{NfsError, NfsResult};

/// Outcome of `Slot::validate_and_claim`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `seqid` matched the current slot sequence; do not re-execute.
    Replay(Vec<u8>),
    /// `seqid` is the next expected value; caller must later call
    /// `commit_reply` (or `abort`) to release the slot.
    NewRequest,
}

#[derive(Debug, Clone)]
pub struct Slot {
    last_seqid: u32,
    in_use: bool,
    cached_reply: Option<Vec<u8>>,
}

impl Slot {
    pub fn new() -> Self {
        Slot { last_seqid: 0, in_use: false, cached_reply: None }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Validates and, on success, claims the slot. Does not store the reply
    /// — that happens in `commit_reply` once the compound has executed.
    pub fn validate_and_claim(&mut self, seqid: u32) -> NfsResult<Outcome> {
        if self.in_use {
            return Err(NfsError::Delay);
        }
        if seqid == self.last_seqid {
            return match &self.cached_reply {
                Some(bytes) => Ok(Outcome::Replay(bytes.clone())),
                // seqid 0 with nothing cached yet only happens before the
                // first request on a freshly created slot; treat as new.
                None if self.last_seqid == 0 => {
                    self.in_use = true;
                    Ok(Outcome::NewRequest)
                }
                None => Err(NfsError::SeqMisordered),
            };
        }
        if seqid == self.last_seqid.wrapping_add(1) {
            self.in_use = true;
            return Ok(Outcome::NewRequest);
        }
        Err(NfsError::SeqMisordered)
    }

    /// Advances `last_seqid`, optionally caching the reply, and releases the
    /// slot. `seqid` must be the value passed to the claiming
    /// `validate_and_claim` call.
    pub fn commit_reply(&mut self, seqid: u32, reply: Vec<u8>, cache_this: bool) {
        self.last_seqid = seqid;
        self.cached_reply = if cache_this { Some(reply) } else { None };
        self.in_use = false;
    }

    /// Releases the slot without advancing sequence state (cancellation).
    pub fn abort(&mut self) {
        self.in_use = false;
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel's slot table: `slots[0..max_requests]`.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(max_requests: u32) -> Self {
        SlotTable { slots: (0..max_requests).map(|_| Slot::new()).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_mut(&mut self, slot_id: u32) -> NfsResult<&mut Slot> {
        self.slots.get_mut(slot_id as usize).ok_or(NfsError::BadSlot)
    }

    pub fn any_in_use(&self) -> bool {
        self.slots.iter().any(Slot::is_in_use)
    }
}
