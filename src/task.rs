//! Connection task pipeline (spec §4.3, §4.9, §5).
//!
//! Mirrors the teacher's split read/dispatch/write task trio
//! (`read_task`/`vfs_task`/`stream_writer`) and its typed-channel-wrapper
//! style (`message_types.rs`), but the read side only ever hands this crate
//! already-decoded `Compound` values — RPC/XDR wire framing is out of scope
//! (spec §1 Non-goals), so there is no `ReadTask` here parsing bytes off a
//! socket. What remains is the half the protocol core owns: running a
//! decoded compound through the `Dispatcher` and writing the encoded reply
//! back out through a connection's `write_mu`-serializing sink.

use crate::backchannel::ConnWriter;
use crate::connection::{ConnId, ConnectionBinding};
use crate::dispatch::{Compound, CompoundReply, Dispatcher, Op};
use crate::session::SessionId;
use crate::state::StateManager;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tracing::debug;

/// A decoded compound awaiting dispatch, tagged with the XID a front end
/// uses to match it back up on the wire.
pub struct CompoundMessage {
    pub xid: u32,
    pub compound: Compound,
    pub client_ip: IpAddr,
}

pub struct ReplyMessage {
    pub xid: u32,
    pub bytes: Vec<u8>,
}

/// Typed sender half of the compound channel (teacher's `ProcSender` idiom).
pub struct CompoundSender {
    sender: mpsc::Sender<CompoundMessage>,
}

impl CompoundSender {
    pub async fn send(&self, xid: u32, compound: Compound, client_ip: IpAddr) -> Result<(), SendError<CompoundMessage>> {
        self.sender.send(CompoundMessage { xid, compound, client_ip }).await
    }
}

pub struct CompoundRecv {
    recv: mpsc::Receiver<CompoundMessage>,
}

impl CompoundRecv {
    pub async fn recv(&mut self) -> Option<CompoundMessage> {
        self.recv.recv().await
    }
}

pub fn create_compound_channel(size: usize) -> (CompoundSender, CompoundRecv) {
    let (sender, recv) = mpsc::channel(size);
    (CompoundSender { sender }, CompoundRecv { recv })
}

pub struct ReplySender {
    sender: mpsc::Sender<ReplyMessage>,
}

impl ReplySender {
    pub async fn send(&self, xid: u32, bytes: Vec<u8>) -> Result<(), SendError<ReplyMessage>> {
        self.sender.send(ReplyMessage { xid, bytes }).await
    }
}

pub struct ReplyRecv {
    recv: mpsc::Receiver<ReplyMessage>,
}

impl ReplyRecv {
    pub async fn recv(&mut self) -> Option<ReplyMessage> {
        self.recv.recv().await
    }
}

pub fn create_reply_channel(size: usize) -> (ReplySender, ReplyRecv) {
    let (sender, recv) = mpsc::channel(size);
    (ReplySender { sender }, ReplyRecv { recv })
}

fn session_id_of(compound: &Compound) -> Option<SessionId> {
    match compound.ops.first() {
        Some(Op::Sequence { session_id, .. }) => Some(*session_id),
        _ => None,
    }
}

/// Drives decoded compounds through the dispatcher, touching the connection
/// binding's fore-activity clock on every compound carrying a `SEQUENCE`
/// (spec §4.9 selection policy input), then forwards the encoded reply on
/// to the write side. Plays the role of the teacher's `VfsTask`.
pub struct DispatchTask {
    compound_recv: CompoundRecv,
    reply_sender: ReplySender,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateManager>,
    binding: Arc<ConnectionBinding>,
    conn_id: ConnId,
    conn_writer: ConnWriter,
    encode: Arc<dyn Fn(&CompoundReply) -> Vec<u8> + Send + Sync>,
}

impl DispatchTask {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        compound_recv: CompoundRecv,
        reply_sender: ReplySender,
        dispatcher: Arc<Dispatcher>,
        state: Arc<StateManager>,
        binding: Arc<ConnectionBinding>,
        conn_id: ConnId,
        conn_writer: ConnWriter,
        encode: Arc<dyn Fn(&CompoundReply) -> Vec<u8> + Send + Sync>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self { compound_recv, reply_sender, dispatcher, state, binding, conn_id, conn_writer, encode }.run().await
        })
    }

    async fn run(mut self) {
        while let Some(msg) = self.compound_recv.recv().await {
            if let Some(session_id) = session_id_of(&msg.compound) {
                self.binding.touch_fore_activity(session_id, self.conn_id).await;
            }
            let encode = self.encode.clone();
            let session_id = session_id_of(&msg.compound);
            let bytes = self.dispatcher.execute(msg.compound, msg.client_ip, move |r| encode(r)).await;
            if let Some(session_id) = session_id {
                // Lazy back-channel registration (spec §4.9): runs after
                // every successful compound, not just BIND_CONN_TO_SESSION,
                // since a back-bound connection only announces itself once
                // it starts carrying fore-channel traffic.
                let _ = self.state.register_conn_writer(session_id, self.conn_id, self.conn_writer.clone()).await;
            }
            if self.reply_sender.send(msg.xid, bytes).await.is_err() {
                debug!(conn_id = self.conn_id.0, "reply channel closed, stopping dispatch task");
                break;
            }
        }
    }
}

/// Writes encoded replies out through a connection's serialized write path
/// (spec §5: `write_mu` serializes fore-channel replies and back-channel
/// callback sends on the same connection). Plays the role of the teacher's
/// `StreamWriter`, minus the RPC record-marking it performs (out of scope).
pub struct WriterTask {
    reply_recv: ReplyRecv,
    writer: crate::backchannel::ConnWriter,
}

impl WriterTask {
    pub fn spawn(reply_recv: ReplyRecv, writer: crate::backchannel::ConnWriter) -> JoinHandle<()> {
        tokio::spawn(async move { Self { reply_recv, writer }.run().await })
    }

    async fn run(mut self) {
        while let Some(msg) = self.reply_recv.recv().await {
            if (self.writer)(msg.bytes).await.is_err() {
                debug!(xid = msg.xid, "connection write failed, stopping writer task");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::StateManager;

    fn dummy_writer() -> ConnWriter {
        Arc::new(|_bytes| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn dispatch_task_forwards_reply_bytes() {
        let sm = StateManager::new(Config::default());
        let dispatcher = Arc::new(Dispatcher::new(sm.clone()));
        let binding = Arc::new(ConnectionBinding::new());
        let (compound_tx, compound_rx) = create_compound_channel(4);
        let (reply_tx, mut reply_rx) = create_reply_channel(4);
        let encode: Arc<dyn Fn(&CompoundReply) -> Vec<u8> + Send + Sync> =
            Arc::new(|reply: &CompoundReply| reply.results.iter().map(|(_, r)| if r.is_ok() { 1u8 } else { 0u8 }).collect());

        let handle =
            DispatchTask::spawn(compound_rx, reply_tx, dispatcher, sm, binding, ConnId(1), dummy_writer(), encode);
        let compound = Compound { tag: "t".into(), minor_version: 1, ops: vec![] };
        compound_tx.send(7, compound, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)).await.unwrap();
        drop(compound_tx);

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.xid, 7);
        handle.await.unwrap();
    }
}
