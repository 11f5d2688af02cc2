//! Backchannel Sender (spec §2.H, §4.8).
//!
//! One sender task per v4.1 session with at least one back-bound
//! connection. Modeled on the teacher's split-task/channel pipeline
//! (`lib.rs`'s `ReadTask`/`VfsTask`/`StreamWriter` trio): a FIFO of
//! `CallbackRequest`, a reply-demux table keyed by XID, and a `ConnWriter`
//! closure registered by `crate::connection`.

use crate::client::ClientId;
use crate::config::Config;
use crate::counters::Counters;
use crate::delegation::{CallbackSink, NotifyEvent};
use crate::error::{NfsError, NfsResult};
use crate::session::SessionId;
use crate::state::open::StateId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum CallbackOp {
    Recall { stateid: StateId, reason: String },
    Notify { dir_handle: Vec<u8>, stateid: StateId, events: Vec<NotifyEvent> },
}

#[derive(Debug)]
pub struct CallbackRequest {
    pub op: CallbackOp,
}

/// A connection's write path, captured as a closure by the Connection
/// Binding layer after a successful COMPOUND on a back-bound connection
/// (spec §4.9). Holds the connection's `write_mu` internally.
pub type ConnWriter = Arc<dyn Fn(Vec<u8>) -> futures_like::BoxFuture + Send + Sync>;

/// Minimal stand-in for `futures::future::BoxFuture` so this module does not
/// need an extra dependency purely for one type alias.
pub mod futures_like {
    use std::future::Future;
    use std::pin::Pin;
    pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send>>;
}

struct PendingReply {
    reply_tx: oneshot::Sender<Vec<u8>>,
}

/// Per-session backchannel sender state, owned by `state::StateManager` and
/// driven by a spawned task (see `Sender::run`).
pub struct Sender {
    session_id: SessionId,
    client_id: ClientId,
    queue_tx: async_channel::Sender<CallbackRequest>,
    queue_rx: async_channel::Receiver<CallbackRequest>,
    pending_replies: Mutex<HashMap<u32, PendingReply>>,
    next_xid: AtomicU32,
    writer: Mutex<Option<ConnWriter>>,
    timeouts: [Duration; 3],
    counters: Arc<Counters>,
}

impl Sender {
    pub fn new(session_id: SessionId, client_id: ClientId, cfg: &Config, counters: Arc<Counters>) -> Arc<Self> {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        Arc::new(Sender {
            session_id,
            client_id,
            queue_tx,
            queue_rx,
            pending_replies: Mutex::new(HashMap::new()),
            next_xid: AtomicU32::new(1),
            writer: Mutex::new(None),
            timeouts: cfg.callback_timeouts(),
            counters,
        })
    }

    pub fn enqueue(&self, op: CallbackOp) {
        let _ = self.queue_tx.try_send(CallbackRequest { op });
    }

    /// Registered by `connection::ConnectionBinding` (spec §4.9).
    pub async fn set_writer(&self, writer: ConnWriter) {
        *self.writer.lock().await = Some(writer);
    }

    pub async fn clear_writer_if(&self, matches: impl Fn(&ConnWriter) -> bool) {
        let mut guard = self.writer.lock().await;
        if guard.as_ref().map(&matches).unwrap_or(false) {
            *guard = None;
        }
    }

    /// Demux entry point (spec §4.8 read-loop demux): hands a REPLY's bytes
    /// to the waiting sender.
    pub async fn deliver_reply(&self, xid: u32, bytes: Vec<u8>) {
        if let Some(pending) = self.pending_replies.lock().await.remove(&xid) {
            let _ = pending.reply_tx.send(bytes);
        }
    }

    fn alloc_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Drains the FIFO, sending one CB_COMPOUND per request with retry
    /// (spec §4.8 send loop). Exits when the queue is closed (session
    /// destroyed, per `cancel`).
    pub async fn run(self: Arc<Self>) {
        while let Ok(request) = self.queue_rx.recv().await {
            let started = std::time::Instant::now();
            let result = self.send_with_retry(&request).await;
            let failed = result.is_err();
            self.counters.callback_completed(started.elapsed().as_millis() as u64, failed);
            if let Err(e) = result {
                warn!(session_id = %self.session_id, error = ?e, "callback failed after retries");
            }
        }
        debug!(session_id = %self.session_id, "backchannel sender exiting, queue closed");
    }

    async fn send_with_retry(&self, request: &CallbackRequest) -> NfsResult<()> {
        for (attempt, timeout) in self.timeouts.into_iter().enumerate() {
            let xid = self.alloc_xid();
            let writer = { self.writer.lock().await.clone() };
            let Some(writer) = writer else {
                return Err(NfsError::CallbackEof);
            };
            let (tx, rx) = oneshot::channel();
            self.pending_replies.lock().await.insert(xid, PendingReply { reply_tx: tx });

            let buf = encode_cb_compound(xid, &request.op);
            if (writer)(buf).await.is_err() {
                self.pending_replies.lock().await.remove(&xid);
                return Err(NfsError::CallbackEof);
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(_reply_bytes)) => return Ok(()),
                Ok(Err(_)) => return Err(NfsError::CallbackEof),
                Err(_) => {
                    self.pending_replies.lock().await.remove(&xid);
                    debug!(session_id = %self.session_id, attempt, "callback timed out, retrying");
                    continue;
                }
            }
        }
        Err(NfsError::CallbackTimeout)
    }

    pub fn cancel(&self) {
        self.queue_rx.close();
    }
}

/// Placeholder CB_COMPOUND encoder: real XDR encoding is out of scope
/// (§6.1); this produces a byte layout stable enough for the demux table
/// and tests to exercise the retry/timeout state machine.
fn encode_cb_compound(xid: u32, op: &CallbackOp) -> Vec<u8> {
    let mut buf = xid.to_be_bytes().to_vec();
    match op {
        CallbackOp::Recall { .. } => buf.push(0),
        CallbackOp::Notify { .. } => buf.push(1),
    }
    buf
}

/// Implements `delegation::CallbackSink` by looking up the sender(s) bound
/// to a client's sessions. Storage of the client→sender map lives on
/// `state::StateManager`; this is the thin adapter the delegation engine
/// calls through.
pub struct BackchannelRegistry {
    senders: std::sync::Mutex<HashMap<SessionId, Arc<Sender>>>,
    by_client: std::sync::Mutex<HashMap<ClientId, Vec<SessionId>>>,
}

impl BackchannelRegistry {
    pub fn new() -> Self {
        BackchannelRegistry {
            senders: std::sync::Mutex::new(HashMap::new()),
            by_client: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, sender: Arc<Sender>) {
        let mut senders = self.senders.lock().unwrap();
        let mut by_client = self.by_client.lock().unwrap();
        by_client.entry(sender.client_id).or_default().push(sender.session_id);
        senders.insert(sender.session_id, sender);
    }

    pub fn unregister(&self, session_id: SessionId, client_id: ClientId) {
        self.senders.lock().unwrap().remove(&session_id);
        if let Some(list) = self.by_client.lock().unwrap().get_mut(&client_id) {
            list.retain(|s| *s != session_id);
        }
    }

    pub fn has_sender_for(&self, client_id: ClientId) -> bool {
        !self.senders_for_client(client_id).is_empty()
    }

    pub fn sender_for_session(&self, session_id: SessionId) -> Option<Arc<Sender>> {
        self.senders.lock().unwrap().get(&session_id).cloned()
    }

    fn senders_for_client(&self, client_id: ClientId) -> Vec<Arc<Sender>> {
        let by_client = self.by_client.lock().unwrap();
        let senders = self.senders.lock().unwrap();
        by_client
            .get(&client_id)
            .into_iter()
            .flatten()
            .filter_map(|sid| senders.get(sid).cloned())
            .collect()
    }
}

impl Default for BackchannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackSink for BackchannelRegistry {
    fn enqueue_recall(&self, client_id: ClientId, stateid: StateId, reason: &str) {
        for sender in self.senders_for_client(client_id) {
            sender.enqueue(CallbackOp::Recall { stateid, reason: reason.to_string() });
        }
    }

    fn enqueue_notify(&self, client_id: ClientId, dir_handle: Vec<u8>, stateid: StateId, events: Vec<NotifyEvent>) {
        for sender in self.senders_for_client(client_id) {
            sender.enqueue(CallbackOp::Notify { dir_handle: dir_handle.clone(), stateid, events: events.clone() });
        }
    }
}
