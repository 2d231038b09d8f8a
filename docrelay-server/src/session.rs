//! Document sessions: one CRDT engine plus the connections subscribed to it.
//!
//! ```text
//!                 ┌──────────────── DocumentSession ────────────────┐
//! inbound delta ─►│ merge_delta ─► engine ─► merge event ─► relay() │─► N-1 subscribers
//!                 │                   ▲                             │
//! new connection ►│ subscribe ────────┴── state_as_delta ───────────│─► new connection only
//!                 └─────────────────────────────────────────────────┘
//! ```
//!
//! Every operation runs under the session lock, so subscriber churn, merges
//! and their fan-out never interleave within one session.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::engine::{CrdtEngine, EngineError};
use crate::relay::{relay, RelayOutcome, RelayStats, RelayStatsSnapshot};

/// Session used when a connection's request path names none.
pub const DEFAULT_SESSION: &str = "default";

/// Opaque identifier of a document session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identity of one live connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Push endpoint for one connection.
///
/// The transport owns the connection; the session only holds this handle for
/// fan-out. Pushing never blocks: bytes queue until the connection's writer
/// sends them.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, outbound }
    }

    /// New handle with a fresh id, plus the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::new(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection's writer is still draining the queue.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn push(&self, delta: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.outbound.send(delta)
    }
}

struct SessionState<E> {
    engine: E,
    subscribers: HashMap<ConnectionId, ConnectionHandle>,
}

/// One shared document and its subscribers.
pub struct DocumentSession<E> {
    id: SessionId,
    state: Mutex<SessionState<E>>,
    stats: RelayStats,
}

impl<E: CrdtEngine> DocumentSession<E> {
    pub fn new(id: SessionId, engine: E) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState {
                engine,
                subscribers: HashMap::new(),
            }),
            stats: RelayStats::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Add a subscriber. Sends nothing.
    pub async fn join(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock().await;
        state.subscribers.insert(handle.id(), handle);
    }

    /// Remove a subscriber if present. The engine is kept either way.
    ///
    /// Returns whether the subscriber was present.
    pub async fn leave(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        state.subscribers.remove(&id).is_some()
    }

    /// Join and send the initial sync as one step.
    ///
    /// The full state is queued on the new connection before the session lock
    /// is released, so it precedes any broadcast the connection receives.
    /// Returns whether an initial delta was sent (nothing is sent for an
    /// empty document).
    pub async fn subscribe(&self, handle: ConnectionHandle) -> bool {
        let mut state = self.state.lock().await;
        let initial = state.engine.state_as_delta();
        let id = handle.id();

        let sent = if initial.is_empty() {
            false
        } else {
            match handle.push(Bytes::from(initial)) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Initial sync to {id} in session {} failed: {e}", self.id);
                    false
                }
            }
        };

        state.subscribers.insert(id, handle);
        sent
    }

    /// Merge `delta` with `origin` as its source and relay the result.
    ///
    /// A delta that changes nothing is not relayed. Errors leave the session
    /// untouched and are for the caller to log.
    pub async fn merge_delta(
        &self,
        delta: &[u8],
        origin: ConnectionId,
    ) -> Result<RelayOutcome, EngineError> {
        let mut state = self.state.lock().await;
        match state.engine.merge(delta)? {
            Some(produced) => Ok(relay(
                &state.subscribers,
                Bytes::from(produced),
                origin,
                &self.stats,
            )),
            None => {
                log::debug!("Delta from {origin} changed nothing in session {}", self.id);
                Ok(RelayOutcome::default())
            }
        }
    }

    pub async fn current_state_as_delta(&self) -> Vec<u8> {
        self.state.lock().await.engine.state_as_delta()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn has_subscriber(&self, id: ConnectionId) -> bool {
        self.state.lock().await.subscribers.contains_key(&id)
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}
