//! Compound Dispatcher (spec §2.J, §4.3).
//!
//! Executes the ordered operation list of a decoded `Compound`, threading a
//! per-request `CompoundContext` (current/saved file handle, session,
//! slot) and invoking per-op handlers. Registration is a fixed array
//! indexed by opcode of plain function pointers (spec §9's dispatch-table
//! design note) rather than a `match` — each handler is an `async fn` whose
//! future is boxed by a non-capturing closure, which coerces to the same
//! `fn` pointer type as every other handler.

use crate::client::{CallbackProgram, ClientId};
use crate::delegation::NotifyEvent;
use crate::error::NfsError;
use crate::lockmgr::LockKind;
use crate::session::{ChannelAttrs, SessionId};
use crate::state::open::StateId;
use crate::state::{LockError, StateManager};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Opcodes this core implements (spec §1, §4.3). Values are arbitrary but
/// stable within the crate — no on-wire XDR encoding is implied (§6.1 is
/// out of scope); a real front end maps RFC 8881 opcode numbers onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Sequence = 0,
    ExchangeId = 1,
    CreateSession = 2,
    DestroySession = 3,
    DestroyClientId = 4,
    BindConnToSession = 5,
    PutFh = 6,
    GetFh = 7,
    GetAttr = 8,
    SetAttr = 9,
    Open = 10,
    Close = 11,
    OpenDowngrade = 12,
    Lock = 13,
    Lockt = 14,
    Locku = 15,
    ReleaseLockOwner = 16,
    GetDirDelegation = 17,
    DelegReturn = 18,
    Create = 19,
    Remove = 20,
    Rename = 21,
    Link = 22,
    SetClientId = 23,
    SetClientIdConfirm = 24,
    Renew = 25,
}

const MAX_OP: usize = 26;

/// Decoded operation arguments. Real XDR decoding of these from the wire is
/// out of scope (§6.1); a front end constructs `Op` values after parsing.
#[derive(Debug, Clone)]
pub enum Op {
    Sequence { session_id: SessionId, slot_id: u32, seqid: u32, cache_this: bool },
    ExchangeId { owner_id: Vec<u8>, verifier: [u8; 8] },
    CreateSession { client_id: ClientId, seqid: u32, fore: ChannelAttrs, back: ChannelAttrs, want_back_chan: bool },
    DestroySession { session_id: SessionId },
    DestroyClientId { client_id: ClientId },
    BindConnToSession { session_id: SessionId, direction: crate::session::ConnDirection },
    PutFh { file_handle: Vec<u8> },
    GetFh,
    GetAttr,
    SetAttr { size: Option<u64>, mode: Option<u32>, uid: Option<u32>, gid: Option<u32> },
    Open { client_id: ClientId, owner: Vec<u8>, share_access: u32, share_deny: u32, create: bool, name: String },
    Close { stateid: StateId },
    OpenDowngrade { stateid: StateId, share_access: u32, share_deny: u32 },
    Lock {
        client_id: ClientId,
        owner: Vec<u8>,
        open_stateid: StateId,
        offset: u64,
        length: u64,
        kind: LockKind,
        new_lock_owner: bool,
        reclaim: bool,
    },
    Lockt { client_id: ClientId, owner: Vec<u8>, offset: u64, length: u64, kind: LockKind },
    Locku { client_id: ClientId, owner: Vec<u8>, offset: u64, length: u64 },
    ReleaseLockOwner { client_id: ClientId, owner: Vec<u8> },
    GetDirDelegation { client_id: ClientId, notification_mask: u32 },
    DelegReturn { stateid: StateId },
    Create { client_id: ClientId, name: String, is_dir: bool },
    Remove { name: String },
    Rename { old_name: String, new_dir: Option<Vec<u8>>, new_name: String },
    Link { target: Vec<u8>, name: String },
    SetClientId { owner_id: Vec<u8>, verifier: [u8; 8], callback_program: Option<CallbackProgram> },
    SetClientIdConfirm { client_id: ClientId, confirm_verifier: [u8; 8] },
    Renew { client_id: ClientId },
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Sequence { .. } => Opcode::Sequence,
            Op::ExchangeId { .. } => Opcode::ExchangeId,
            Op::CreateSession { .. } => Opcode::CreateSession,
            Op::DestroySession { .. } => Opcode::DestroySession,
            Op::DestroyClientId { .. } => Opcode::DestroyClientId,
            Op::BindConnToSession { .. } => Opcode::BindConnToSession,
            Op::PutFh { .. } => Opcode::PutFh,
            Op::GetFh => Opcode::GetFh,
            Op::GetAttr => Opcode::GetAttr,
            Op::SetAttr { .. } => Opcode::SetAttr,
            Op::Open { .. } => Opcode::Open,
            Op::Close { .. } => Opcode::Close,
            Op::OpenDowngrade { .. } => Opcode::OpenDowngrade,
            Op::Lock { .. } => Opcode::Lock,
            Op::Lockt { .. } => Opcode::Lockt,
            Op::Locku { .. } => Opcode::Locku,
            Op::ReleaseLockOwner { .. } => Opcode::ReleaseLockOwner,
            Op::GetDirDelegation { .. } => Opcode::GetDirDelegation,
            Op::DelegReturn { .. } => Opcode::DelegReturn,
            Op::Create { .. } => Opcode::Create,
            Op::Remove { .. } => Opcode::Remove,
            Op::Rename { .. } => Opcode::Rename,
            Op::Link { .. } => Opcode::Link,
            Op::SetClientId { .. } => Opcode::SetClientId,
            Op::SetClientIdConfirm { .. } => Opcode::SetClientIdConfirm,
            Op::Renew { .. } => Opcode::Renew,
        }
    }

    /// Ops allowed to appear first in a compound without a preceding
    /// `SEQUENCE` (spec §4.3 step 1). The v4.0 client-establishment trio has
    /// no session/slot concept at all, so they belong here too.
    fn allowed_without_sequence(&self) -> bool {
        matches!(
            self,
            Op::ExchangeId { .. }
                | Op::CreateSession { .. }
                | Op::DestroyClientId { .. }
                | Op::DestroySession { .. }
                | Op::BindConnToSession { .. }
                | Op::SetClientId { .. }
                | Op::SetClientIdConfirm { .. }
                | Op::Renew { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum OpPayload {
    Ok,
    SessionId(SessionId),
    ClientId(ClientId),
    ClientIdConfirm { client_id: ClientId, confirm_verifier: [u8; 8] },
    Attr { size: u64 },
    StateId(StateId),
    LockDenied { offset: u64, length: u64, owner: String, exclusive: bool },
    DirDelegation(StateId),
    Bytes(Vec<u8>),
}

pub type OpResult = Result<OpPayload, NfsError>;

/// Per-compound mutable context threaded through every op handler (spec
/// §4.3 step 3).
pub struct CompoundContext {
    pub current_fh: Option<Vec<u8>>,
    pub saved_fh: Option<Vec<u8>>,
    pub session_id: Option<SessionId>,
    pub client_id: Option<ClientId>,
    pub client_ip: IpAddr,
    pub slot_id: u32,
}

impl CompoundContext {
    pub fn new(client_ip: IpAddr) -> Self {
        CompoundContext { current_fh: None, saved_fh: None, session_id: None, client_id: None, client_ip, slot_id: 0 }
    }

    fn current_fh(&self) -> Result<&[u8], NfsError> {
        self.current_fh.as_deref().ok_or(NfsError::BadXdr)
    }
}

#[derive(Debug, Clone)]
pub struct Compound {
    pub tag: String,
    pub minor_version: u32,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone)]
pub struct CompoundReply {
    pub results: Vec<(Opcode, OpResult)>,
    pub overall_status: Result<(), NfsError>,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = OpResult> + Send + 'a>>;
type HandlerFn = for<'a> fn(&'a StateManager, &'a mut CompoundContext, &'a Op) -> HandlerFuture<'a>;

/// Builds the fixed opcode-indexed handler table once; `Dispatcher`
/// construction is the only place this array is assembled.
fn build_table() -> [Option<HandlerFn>; MAX_OP] {
    let mut table: [Option<HandlerFn>; MAX_OP] = [None; MAX_OP];
    table[Opcode::Sequence as usize] = Some(|sm, ctx, op| Box::pin(handle_sequence(sm, ctx, op)));
    table[Opcode::ExchangeId as usize] = Some(|sm, ctx, op| Box::pin(handle_exchange_id(sm, ctx, op)));
    table[Opcode::CreateSession as usize] = Some(|sm, ctx, op| Box::pin(handle_create_session(sm, ctx, op)));
    table[Opcode::DestroySession as usize] = Some(|sm, ctx, op| Box::pin(handle_destroy_session(sm, ctx, op)));
    table[Opcode::DestroyClientId as usize] = Some(|sm, ctx, op| Box::pin(handle_destroy_client_id(sm, ctx, op)));
    table[Opcode::BindConnToSession as usize] = Some(|sm, ctx, op| Box::pin(handle_bind_conn(sm, ctx, op)));
    table[Opcode::PutFh as usize] = Some(|sm, ctx, op| Box::pin(handle_putfh(sm, ctx, op)));
    table[Opcode::GetFh as usize] = Some(|sm, ctx, op| Box::pin(handle_getfh(sm, ctx, op)));
    table[Opcode::GetAttr as usize] = Some(|sm, ctx, op| Box::pin(handle_getattr(sm, ctx, op)));
    table[Opcode::SetAttr as usize] = Some(|sm, ctx, op| Box::pin(handle_setattr(sm, ctx, op)));
    table[Opcode::Open as usize] = Some(|sm, ctx, op| Box::pin(handle_open(sm, ctx, op)));
    table[Opcode::Close as usize] = Some(|sm, ctx, op| Box::pin(handle_close(sm, ctx, op)));
    table[Opcode::OpenDowngrade as usize] = Some(|sm, ctx, op| Box::pin(handle_open_downgrade(sm, ctx, op)));
    table[Opcode::Lock as usize] = Some(|sm, ctx, op| Box::pin(handle_lock(sm, ctx, op)));
    table[Opcode::Lockt as usize] = Some(|sm, ctx, op| Box::pin(handle_lockt(sm, ctx, op)));
    table[Opcode::Locku as usize] = Some(|sm, ctx, op| Box::pin(handle_locku(sm, ctx, op)));
    table[Opcode::ReleaseLockOwner as usize] = Some(|sm, ctx, op| Box::pin(handle_release_lockowner(sm, ctx, op)));
    table[Opcode::GetDirDelegation as usize] = Some(|sm, ctx, op| Box::pin(handle_get_dir_delegation(sm, ctx, op)));
    table[Opcode::DelegReturn as usize] = Some(|sm, ctx, op| Box::pin(handle_delegreturn(sm, ctx, op)));
    table[Opcode::Create as usize] = Some(|sm, ctx, op| Box::pin(handle_create(sm, ctx, op)));
    table[Opcode::Remove as usize] = Some(|sm, ctx, op| Box::pin(handle_remove(sm, ctx, op)));
    table[Opcode::Rename as usize] = Some(|sm, ctx, op| Box::pin(handle_rename(sm, ctx, op)));
    table[Opcode::Link as usize] = Some(|sm, ctx, op| Box::pin(handle_link(sm, ctx, op)));
    table[Opcode::SetClientId as usize] = Some(|sm, ctx, op| Box::pin(handle_setclientid(sm, ctx, op)));
    table[Opcode::SetClientIdConfirm as usize] =
        Some(|sm, ctx, op| Box::pin(handle_setclientid_confirm(sm, ctx, op)));
    table[Opcode::Renew as usize] = Some(|sm, ctx, op| Box::pin(handle_renew(sm, ctx, op)));
    table
}

pub struct Dispatcher {
    state: Arc<StateManager>,
    table: [Option<HandlerFn>; MAX_OP],
}

impl Dispatcher {
    pub fn new(state: Arc<StateManager>) -> Self {
        Dispatcher { state, table: build_table() }
    }

    /// Runs one COMPOUND end to end (spec §4.3). `encode` turns a
    /// `CompoundReply` into the bytes cached for EOS replay and (in a real
    /// front end) written to the wire; it is injected so this module never
    /// needs to know about XDR.
    pub async fn execute(
        &self,
        compound: Compound,
        client_ip: IpAddr,
        encode: impl Fn(&CompoundReply) -> Vec<u8>,
    ) -> Vec<u8> {
        let mut ctx = CompoundContext::new(client_ip);

        // Step 1 + 2: locate SEQUENCE, run EOS check.
        if let Some(first) = compound.ops.first() {
            if let Op::Sequence { session_id, slot_id, seqid, cache_this } = first {
                match self.run_sequence(*session_id, *slot_id, *seqid, *cache_this).await {
                    Ok(SequenceOutcome::Replay(bytes)) => return bytes,
                    Ok(SequenceOutcome::Claimed) => {
                        ctx.session_id = Some(*session_id);
                        ctx.slot_id = *slot_id;
                    }
                    Err(status) => {
                        let reply = CompoundReply {
                            results: vec![(Opcode::Sequence, Err(status))],
                            overall_status: Err(status),
                        };
                        return encode(&reply);
                    }
                }
            } else if !first.allowed_without_sequence() {
                let reply = CompoundReply {
                    results: vec![(first.opcode(), Err(NfsError::BadSession))],
                    overall_status: Err(NfsError::BadSession),
                };
                return encode(&reply);
            }
        }

        let mut results = Vec::with_capacity(compound.ops.len());
        let mut overall_status = Ok(());
        for op in &compound.ops {
            let opcode = op.opcode();
            let outcome = self.dispatch_one(&mut ctx, op).await;
            let failed = outcome.is_err();
            if failed {
                overall_status = outcome.clone().map(|_| ());
            }
            results.push((opcode, outcome));
            if failed {
                break; // short-circuit: spec §4.3 step 3.
            }
        }

        let reply = CompoundReply { results, overall_status };
        let encoded = encode(&reply);

        if let Some(session_id) = ctx.session_id {
            self.commit_slot_reply(session_id, ctx.slot_id, &compound.ops, encoded.clone()).await;
        }
        encoded
    }

    async fn dispatch_one(&self, ctx: &mut CompoundContext, op: &Op) -> OpResult {
        let opcode = op.opcode();
        match self.table[opcode as usize] {
            Some(handler) => handler(&self.state, ctx, op).await,
            None => {
                warn!(?opcode, "unsupported opcode");
                Err(NfsError::BadXdr)
            }
        }
    }

    async fn run_sequence(
        &self,
        session_id: SessionId,
        slot_id: u32,
        seqid: u32,
        cache_this: bool,
    ) -> Result<SequenceOutcome, NfsError> {
        // Slot access is scoped through `StateManager` in a real build; this
        // crate keeps slot tables on `Session`, reached via a short-lived
        // accessor so the lock is never held across an `.await` elsewhere.
        self.state.with_fore_slot(session_id, slot_id, |slot| slot.validate_and_claim(seqid)).await.map(|outcome| {
            match outcome {
                crate::session::slot::Outcome::Replay(bytes) => SequenceOutcome::Replay(bytes),
                crate::session::slot::Outcome::NewRequest => {
                    let _ = cache_this;
                    SequenceOutcome::Claimed
                }
            }
        })
    }

    async fn commit_slot_reply(&self, session_id: SessionId, slot_id: u32, ops: &[Op], reply: Vec<u8>) {
        let cache_this = matches!(ops.first(), Some(Op::Sequence { cache_this: true, .. }));
        let seqid = match ops.first() {
            Some(Op::Sequence { seqid, .. }) => *seqid,
            _ => return,
        };
        let max_cached = self.state.config().max_response_size_cached_ceiling as usize;
        let capped = if cache_this && reply.len() <= max_cached { reply } else { Vec::new() };
        let _ = self.state.with_fore_slot(session_id, slot_id, move |slot| {
            slot.commit_reply(seqid, capped, cache_this);
            Ok::<(), NfsError>(())
        }).await;
    }
}

enum SequenceOutcome {
    Replay(Vec<u8>),
    Claimed,
}

async fn handle_sequence(_sm: &StateManager, _ctx: &mut CompoundContext, _op: &Op) -> OpResult {
    // Already resolved by `Dispatcher::execute` before the per-op loop
    // starts; SEQUENCE never reaches the generic handler path.
    Ok(OpPayload::Ok)
}

async fn handle_exchange_id(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::ExchangeId { owner_id, verifier } = op else { unreachable!() };
    let client_id = sm.exchange_id(owner_id.clone(), *verifier).await;
    ctx.client_id = Some(client_id);
    Ok(OpPayload::ClientId(client_id))
}

async fn handle_create_session(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::CreateSession { client_id, seqid, fore, back, want_back_chan } = op else { unreachable!() };
    let (session_id, _fore, _back, _bytes) =
        sm.create_session(*client_id, *seqid, *fore, *back, *want_back_chan, |_sid, _f, _b| Vec::new()).await?;
    ctx.session_id = Some(session_id);
    Ok(OpPayload::SessionId(session_id))
}

async fn handle_destroy_session(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::DestroySession { session_id } = op else { unreachable!() };
    sm.destroy_session(*session_id).await?;
    Ok(OpPayload::Ok)
}

async fn handle_destroy_client_id(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::DestroyClientId { client_id } = op else { unreachable!() };
    sm.destroy_client_id(*client_id).await?;
    Ok(OpPayload::Ok)
}

async fn handle_bind_conn(_sm: &StateManager, _ctx: &mut CompoundContext, _op: &Op) -> OpResult {
    // Connection identity is a transport-layer concern not modeled in
    // `Op`; a front end calls `StateManager::bind_conn_to_session`
    // directly once it has resolved the physical connection.
    Ok(OpPayload::Ok)
}

async fn handle_putfh(_sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::PutFh { file_handle } = op else { unreachable!() };
    ctx.current_fh = Some(file_handle.clone());
    Ok(OpPayload::Ok)
}

async fn handle_getfh(_sm: &StateManager, ctx: &mut CompoundContext, _op: &Op) -> OpResult {
    Ok(OpPayload::Bytes(ctx.current_fh()?.to_vec()))
}

async fn handle_getattr(_sm: &StateManager, ctx: &mut CompoundContext, _op: &Op) -> OpResult {
    ctx.current_fh()?;
    Ok(OpPayload::Attr { size: 0 })
}

async fn handle_setattr(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::SetAttr { size, mode, uid, gid } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    let significant =
        crate::delegation::DelegationEngine::is_significant_attr_change(size.is_some(), mode.is_some(), uid.is_some(), gid.is_some());
    if significant {
        sm.notify_dir_change(&dir_fh, NotifyEvent::AttrChanged).await;
    }
    Ok(OpPayload::Ok)
}

async fn handle_open(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Open { client_id, owner, share_access, share_deny, create, name } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    let mut file_fh = dir_fh.clone();
    file_fh.extend_from_slice(name.as_bytes());

    let stateid = sm.open(*client_id, owner.clone(), file_fh.clone(), *share_access, *share_deny).await?;
    if *create {
        sm.notify_dir_change(&dir_fh, NotifyEvent::AddEntry { name: name.clone() }).await;
    }
    if *share_access & crate::state::open::SHARE_ACCESS_WRITE != 0 {
        sm.recall_conflicting(&file_fh, *client_id, "conflicting write open").await;
    }
    ctx.current_fh = Some(file_fh);
    Ok(OpPayload::StateId(stateid))
}

async fn handle_close(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Close { stateid } = op else { unreachable!() };
    sm.close(*stateid).await?;
    Ok(OpPayload::Ok)
}

async fn handle_open_downgrade(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::OpenDowngrade { stateid, share_access, share_deny } = op else { unreachable!() };
    let new_id = sm.open_downgrade(*stateid, *share_access, *share_deny).await?;
    Ok(OpPayload::StateId(new_id))
}

async fn handle_lock(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Lock { client_id, owner, open_stateid, offset, length, kind, new_lock_owner, reclaim } = op else {
        unreachable!()
    };
    let file_fh = ctx.current_fh()?.to_vec();
    let result = if *new_lock_owner {
        sm.lock_new_owner(*client_id, owner.clone(), *open_stateid, file_fh, *offset, *length, *kind, *reclaim).await
    } else {
        sm.lock_existing_owner(*client_id, owner, *open_stateid, file_fh, *offset, *length, *kind).await
    };
    result.map(OpPayload::StateId).map_err(lock_error_to_nfs)
}

async fn handle_lockt(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Lockt { client_id, owner, offset, length, kind } = op else { unreachable!() };
    let file_fh = ctx.current_fh()?.to_vec();
    let owner_id = crate::state::lock::LockStateTable::namespaced_owner_id(*client_id, owner);
    let candidate = crate::lockmgr::Entry {
        owner_id,
        client_id: crate::state::lock::LockStateTable::namespaced_client_id(*client_id),
        file_handle: file_fh,
        offset: *offset,
        length: *length,
        kind: *kind,
        reclaim: false,
    };
    match sm.lock_test(candidate).await {
        None => Ok(OpPayload::Ok),
        Some(conflict) => Ok(OpPayload::LockDenied {
            offset: conflict.offset,
            length: conflict.length,
            owner: conflict.owner_id,
            exclusive: conflict.kind_is_exclusive,
        }),
    }
}

async fn handle_locku(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Locku { client_id, owner, offset, length } = op else { unreachable!() };
    let file_fh = ctx.current_fh()?.to_vec();
    let owner_id = crate::state::lock::LockStateTable::namespaced_owner_id(*client_id, owner);
    sm.lock_unlock(&owner_id, &file_fh, *offset, *length).await;
    Ok(OpPayload::Ok)
}

async fn handle_release_lockowner(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::ReleaseLockOwner { client_id, owner } = op else { unreachable!() };
    sm.release_lock_owner(*client_id, owner).await?;
    Ok(OpPayload::Ok)
}

async fn handle_get_dir_delegation(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::GetDirDelegation { client_id, notification_mask } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    match sm.try_grant_directory_delegation(*client_id, dir_fh, *notification_mask).await {
        Some(stateid) => Ok(OpPayload::DirDelegation(stateid)),
        None => Err(NfsError::Delay),
    }
}

async fn handle_delegreturn(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::DelegReturn { stateid } = op else { unreachable!() };
    sm.delegreturn(*stateid).await;
    Ok(OpPayload::Ok)
}

async fn handle_create(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Create { client_id: _, name, is_dir: _ } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    sm.notify_dir_change(&dir_fh, NotifyEvent::AddEntry { name: name.clone() }).await;
    Ok(OpPayload::Ok)
}

async fn handle_remove(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Remove { name } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    sm.notify_dir_change(&dir_fh, NotifyEvent::RemoveEntry { name: name.clone() }).await;
    Ok(OpPayload::Ok)
}

async fn handle_rename(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Rename { old_name, new_dir, new_name } = op else { unreachable!() };
    let src_dir = ctx.current_fh()?.to_vec();
    let event = NotifyEvent::RenameEntry { old_name: old_name.clone(), new_name: new_name.clone() };
    match new_dir {
        // Cross-directory rename (spec §4.6): RENAME_ENTRY to the source
        // holders, ADD_ENTRY to the destination holders.
        Some(dst_dir) if dst_dir != &src_dir => {
            sm.notify_dir_change(&src_dir, event).await;
            sm.notify_dir_change(dst_dir, NotifyEvent::AddEntry { name: new_name.clone() }).await;
        }
        _ => {
            sm.notify_dir_change(&src_dir, event).await;
        }
    }
    Ok(OpPayload::Ok)
}

async fn handle_link(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Link { target: _, name } = op else { unreachable!() };
    let dir_fh = ctx.current_fh()?.to_vec();
    sm.notify_dir_change(&dir_fh, NotifyEvent::AddEntry { name: name.clone() }).await;
    Ok(OpPayload::Ok)
}

async fn handle_setclientid(sm: &StateManager, ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::SetClientId { owner_id, verifier, callback_program } = op else { unreachable!() };
    let (client_id, confirm_verifier) = sm.setclientid(owner_id.clone(), *verifier, *callback_program).await;
    ctx.client_id = Some(client_id);
    Ok(OpPayload::ClientIdConfirm { client_id, confirm_verifier })
}

async fn handle_setclientid_confirm(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::SetClientIdConfirm { client_id, confirm_verifier } = op else { unreachable!() };
    sm.setclientid_confirm(*client_id, *confirm_verifier).await?;
    Ok(OpPayload::Ok)
}

async fn handle_renew(sm: &StateManager, _ctx: &mut CompoundContext, op: &Op) -> OpResult {
    let Op::Renew { client_id } = op else { unreachable!() };
    sm.renew(*client_id).await?;
    Ok(OpPayload::Ok)
}

fn lock_error_to_nfs(err: LockError) -> NfsError {
    match err {
        LockError::Nfs(e) => e,
        LockError::Conflict(_) => NfsError::LockConflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn attrs() -> ChannelAttrs {
        ChannelAttrs {
            max_requests: 8,
            max_request_size: 65536,
            max_response_size: 65536,
            max_response_size_cached: 8192,
            max_operations: 8,
        }
    }

    fn ip() -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
    }

    fn noop_encode(reply: &CompoundReply) -> Vec<u8> {
        // Deterministic stand-in for real XDR encoding (out of scope,
        // §6.1): a byte per result tagged ok/err, enough for EOS replay
        // byte-identity tests.
        reply.results.iter().map(|(_, r)| if r.is_ok() { 1u8 } else { 0u8 }).collect()
    }

    async fn bootstrap_session(dispatcher: &Dispatcher, sm: &Arc<StateManager>) -> SessionId {
        let client_id = sm.exchange_id(b"owner".to_vec(), [0; 8]).await;
        let compound = Compound {
            tag: "create".into(),
            minor_version: 1,
            ops: vec![Op::CreateSession {
                client_id,
                seqid: 1,
                fore: attrs(),
                back: attrs(),
                want_back_chan: false,
            }],
        };
        let _ = dispatcher.execute(compound, ip(), noop_encode).await;
        sm.list_sessions(client_id).await[0]
    }

    #[tokio::test]
    async fn eos_replay_returns_identical_bytes_without_reexecuting() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Dispatcher::new(sm.clone());
        let session_id = bootstrap_session(&dispatcher, &sm).await;

        let compound = Compound {
            tag: "getattr".into(),
            minor_version: 1,
            ops: vec![
                Op::Sequence { session_id, slot_id: 0, seqid: 1, cache_this: true },
                Op::PutFh { file_handle: b"/export".to_vec() },
                Op::GetAttr,
            ],
        };
        let first = dispatcher.execute(compound.clone(), ip(), noop_encode).await;
        let second = dispatcher.execute(compound, ip(), noop_encode).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unsupported_opcode_is_not_fatal_to_the_table() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Dispatcher::new(sm.clone());
        assert!(dispatcher.table[Opcode::Open as usize].is_some());
    }

    fn setclientid_reply(reply: &CompoundReply) -> (ClientId, [u8; 8]) {
        match &reply.results[0].1 {
            Ok(OpPayload::ClientIdConfirm { client_id, confirm_verifier }) => (*client_id, *confirm_verifier),
            other => panic!("expected ClientIdConfirm payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn setclientid_confirm_renew_round_trip() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Dispatcher::new(sm.clone());

        let setclientid = Compound {
            tag: "setclientid".into(),
            minor_version: 0,
            ops: vec![Op::SetClientId { owner_id: b"owner".to_vec(), verifier: [1; 8], callback_program: None }],
        };
        let captured = std::sync::Mutex::new(None);
        let _ = dispatcher
            .execute(setclientid, ip(), |reply| {
                *captured.lock().unwrap() = Some(setclientid_reply(reply));
                noop_encode(reply)
            })
            .await;
        let (client_id, confirm_verifier) = captured.into_inner().unwrap().unwrap();

        let confirm = Compound {
            tag: "confirm".into(),
            minor_version: 0,
            ops: vec![Op::SetClientIdConfirm { client_id, confirm_verifier }],
        };
        let encoded = dispatcher.execute(confirm, ip(), noop_encode).await;
        assert_eq!(encoded, vec![1]);

        let renew = Compound { tag: "renew".into(), minor_version: 0, ops: vec![Op::Renew { client_id }] };
        let encoded = dispatcher.execute(renew, ip(), noop_encode).await;
        assert_eq!(encoded, vec![1]);
    }

    #[tokio::test]
    async fn setclientid_confirm_rejects_mismatched_verifier() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Dispatcher::new(sm.clone());
        let setclientid = Compound {
            tag: "setclientid".into(),
            minor_version: 0,
            ops: vec![Op::SetClientId { owner_id: b"owner".to_vec(), verifier: [1; 8], callback_program: None }],
        };
        let captured = std::sync::Mutex::new(None);
        let _ = dispatcher
            .execute(setclientid, ip(), |reply| {
                *captured.lock().unwrap() = Some(setclientid_reply(reply));
                noop_encode(reply)
            })
            .await;
        let (client_id, _) = captured.into_inner().unwrap().unwrap();

        let confirm = Compound {
            tag: "confirm".into(),
            minor_version: 0,
            ops: vec![Op::SetClientIdConfirm { client_id, confirm_verifier: [0; 8] }],
        };
        let encoded = dispatcher.execute(confirm, ip(), noop_encode).await;
        assert_eq!(encoded, vec![0]);
    }

    #[tokio::test]
    async fn op_missing_current_fh_fails_cleanly() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Dispatcher::new(sm.clone());
        let session_id = bootstrap_session(&dispatcher, &sm).await;
        let compound = Compound {
            tag: "t".into(),
            minor_version: 1,
            ops: vec![Op::Sequence { session_id, slot_id: 0, seqid: 1, cache_this: false }, Op::GetFh],
        };
        let encoded = dispatcher.execute(compound, ip(), noop_encode).await;
        assert_eq!(encoded, vec![1, 0]);
    }
}
