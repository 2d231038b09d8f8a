//! Session registry: maps session ids to document sessions.
//!
//! Sessions are created on first reference and kept for the life of the
//! process, including while they have no subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::CrdtEngine;
use crate::session::{DocumentSession, SessionId};

pub struct SessionRegistry<E> {
    sessions: RwLock<HashMap<SessionId, Arc<DocumentSession<E>>>>,
}

impl<E: CrdtEngine + Default> SessionRegistry<E> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for `id`, creating it with a fresh engine if needed.
    ///
    /// Racing first calls for the same id all observe one session.
    pub async fn resolve(&self, id: &SessionId) -> Arc<DocumentSession<E>> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return Arc::clone(session);
            }
        }

        // Slow path: write lock, re-checked since another caller may have
        // created it in between.
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Arc::clone(session);
        }

        let session = Arc::new(DocumentSession::new(id.clone(), E::default()));
        sessions.insert(id.clone(), Arc::clone(&session));
        log::info!("Created session {id} ({} total)", sessions.len());
        session
    }

    /// Look up a session without creating it.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<DocumentSession<E>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

impl<E: CrdtEngine + Default> Default for SessionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
