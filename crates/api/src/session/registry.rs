use dashmap::DashMap;
use tokio::sync::mpsc;

use super::SessionMsg;

/// A cheap handle to a live session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub source_lang: String,
    pub cmd_tx: mpsc::Sender<SessionMsg>,
}

/// Process-wide mapping from session id to its handle. Sessions are
/// created on host connect and destroyed on host disconnect or explicit
/// close; nothing is persisted.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id.clone(), handle);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|h| h.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
