//! Connection Binding (spec §2.I, §4.9).

use crate::backchannel::ConnWriter;
use crate::session::SessionId;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fore,
    Back,
    Both,
}

impl Direction {
    pub fn includes_back(self) -> bool {
        matches!(self, Direction::Back | Direction::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub session_id: SessionId,
    pub direction: Direction,
}

struct BackBinding {
    conn_id: ConnId,
    writer: ConnWriter,
    last_fore_activity: Instant,
}

/// Tracks, per session, which back-bound connections are available and
/// which one is currently selected (spec §4.9 selection policy: most recent
/// fore-channel activity).
#[derive(Default)]
struct SessionBackState {
    candidates: Vec<BackBinding>,
}

pub struct ConnectionBinding {
    bindings: Mutex<HashMap<ConnId, Binding>>,
    back_state: Mutex<HashMap<SessionId, SessionBackState>>,
}

impl ConnectionBinding {
    pub fn new() -> Self {
        ConnectionBinding { bindings: Mutex::new(HashMap::new()), back_state: Mutex::new(HashMap::new()) }
    }

    /// `BIND_CONN_TO_SESSION`.
    pub async fn bind(&self, conn_id: ConnId, session_id: SessionId, direction: Direction) {
        self.bindings.lock().await.insert(conn_id, Binding { session_id, direction });
    }

    pub async fn binding_of(&self, conn_id: ConnId) -> Option<Binding> {
        self.bindings.lock().await.get(&conn_id).copied()
    }

    /// Lazy back-channel registration (spec §4.9): called after any
    /// successful COMPOUND on a connection whose session requested
    /// `CREATE_SESSION4_FLAG_CONN_BACK_CHAN`.
    pub async fn register_conn_writer(&self, session_id: SessionId, conn_id: ConnId, writer: ConnWriter) {
        let mut state = self.back_state.lock().await;
        let entry = state.entry(session_id).or_default();
        entry.candidates.retain(|c| c.conn_id != conn_id);
        entry.candidates.push(BackBinding { conn_id, writer, last_fore_activity: Instant::now() });
    }

    pub async fn touch_fore_activity(&self, session_id: SessionId, conn_id: ConnId) {
        if let Some(state) = self.back_state.lock().await.get_mut(&session_id) {
            if let Some(c) = state.candidates.iter_mut().find(|c| c.conn_id == conn_id) {
                c.last_fore_activity = Instant::now();
            }
        }
    }

    /// Selection policy: most recent fore-channel activity wins.
    pub async fn select_writer(&self, session_id: SessionId) -> Option<ConnWriter> {
        let state = self.back_state.lock().await;
        state
            .get(&session_id)
            .and_then(|s| s.candidates.iter().max_by_key(|c| c.last_fore_activity))
            .map(|c| c.writer.clone())
    }

    /// On disconnect: unregisters the writer for `conn_id`.
    pub async fn unregister(&self, session_id: SessionId, conn_id: ConnId) {
        self.bindings.lock().await.remove(&conn_id);
        if let Some(state) = self.back_state.lock().await.get_mut(&session_id) {
            state.candidates.retain(|c| c.conn_id != conn_id);
        }
    }

    pub async fn drop_session(&self, session_id: SessionId) {
        self.back_state.lock().await.remove(&session_id);
    }
}

impl Default for ConnectionBinding {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dummy_writer() -> ConnWriter {
        Arc::new(|_bytes| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn selects_most_recently_active_back_connection() {
        let cb = ConnectionBinding::new();
        let sid = SessionId([0; 16]);
        cb.register_conn_writer(sid, ConnId(1), dummy_writer()).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cb.register_conn_writer(sid, ConnId(2), dummy_writer()).await;
        cb.touch_fore_activity(sid, ConnId(2)).await;
        assert!(cb.select_writer(sid).await.is_some());
    }

    #[tokio::test]
    async fn unregister_removes_candidate() {
        let cb = ConnectionBinding::new();
        let sid = SessionId([0; 16]);
        cb.register_conn_writer(sid, ConnId(1), dummy_writer()).await;
        cb.unregister(sid, ConnId(1)).await;
        assert!(cb.select_writer(sid).await.is_none());
    }
}
