//! Session Management (spec §2.B, §3.2, §4.2).

pub mod slot;

use crate::client::ClientId;
use crate::config::Config;
use slot::SlotTable;
use std::time::Instant;

/// 16-byte cryptographically random session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub fn new_random(client_id: ClientId, sequence_id: u32) -> Self {
        use rand::RngCore;
        let mut id = [0u8; 16];
        id[0..8].copy_from_slice(&client_id.0.to_be_bytes());
        id[8..12].copy_from_slice(&sequence_id.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut id[12..16]);
        SessionId(id)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Negotiated per-channel attributes (spec §4.1). Requested values are
/// clamped monotonically downward against the server's floor/ceiling; the
/// server never raises what the client asked for.
#[derive(Debug, Clone, Copy)]
pub struct ChannelAttrs {
    pub max_requests: u32,
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_response_size_cached: u32,
    pub max_operations: u32,
}

impl ChannelAttrs {
    /// Negotiates fore-channel attributes from a client request (spec §4.1).
    pub fn negotiate_fore(cfg: &Config, requested: &ChannelAttrs) -> ChannelAttrs {
        Self::negotiate(cfg, requested, cfg.fore_max_requests_ceiling)
    }

    /// Negotiates back-channel attributes (lower request-count ceiling).
    pub fn negotiate_back(cfg: &Config, requested: &ChannelAttrs) -> ChannelAttrs {
        Self::negotiate(cfg, requested, cfg.back_max_requests_ceiling)
    }

    fn negotiate(cfg: &Config, requested: &ChannelAttrs, requests_ceiling: u32) -> ChannelAttrs {
        ChannelAttrs {
            max_requests: requested.max_requests.clamp(1, requests_ceiling),
            max_request_size: requested
                .max_request_size
                .clamp(cfg.max_request_size_floor, cfg.max_request_size_ceiling),
            max_response_size: requested
                .max_response_size
                .clamp(cfg.max_request_size_floor, cfg.max_request_size_ceiling),
            max_response_size_cached: requested
                .max_response_size_cached
                .min(cfg.max_response_size_cached_ceiling),
            // unbounded per spec §4.1; the client's request passes through.
            max_operations: requested.max_operations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDirection {
    Fore,
    Back,
    Both,
}

#[derive(Debug, Clone, Copy)]
pub struct CallbackSecParms {
    pub flavor: u32,
}

#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub fore_channel: SlotTable,
    pub back_channel: SlotTable,
    pub fore_attrs: ChannelAttrs,
    pub back_attrs: ChannelAttrs,
    pub callback_sec_parms: CallbackSecParms,
    pub created_at: Instant,
    pub back_chan_requested: bool,
    /// Set once a `backchannel::Sender` task is spawned for this session.
    pub back_sender_bound: bool,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        client_id: ClientId,
        fore_attrs: ChannelAttrs,
        back_attrs: ChannelAttrs,
        back_chan_requested: bool,
        now: Instant,
    ) -> Self {
        Session {
            session_id,
            client_id,
            fore_channel: SlotTable::new(fore_attrs.max_requests),
            back_channel: SlotTable::new(back_attrs.max_requests),
            fore_attrs,
            back_attrs,
            callback_sec_parms: CallbackSecParms { flavor: 0 },
            created_at: now,
            back_chan_requested,
            back_sender_bound: false,
        }
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }
}
