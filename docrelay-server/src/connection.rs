//! Connection handling: binds one WebSocket connection to one session.
//!
//! Lifecycle per connection:
//! ```text
//! Connecting ──(path parsed, session resolved)──► Joined ──(close/error)──► Left
//!                                                  │  ▲
//!                                                  └──┘ binary frames merged
//! ```
//! A connection never leaves `Left`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::engine::CrdtEngine;
use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::relay::RelayOutcome;
use crate::server::ServerStats;
use crate::session::{ConnectionHandle, ConnectionId, DocumentSession, SessionId};

/// Session id for a request path: one leading `/` is stripped, and an empty
/// remainder selects the default session.
pub fn session_id_from_path(path: &str) -> SessionId {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        SessionId::default()
    } else {
        SessionId::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Joined,
    Left,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Binary delta merged; carries the fan-out result
    Merged { bytes: usize, outcome: RelayOutcome },
    /// The engine rejected the delta
    MergeFailed { bytes: usize },
    /// Non-binary data frame, discarded
    Rejected,
    /// Control frame, or the connection has already left
    Ignored,
}

/// Translates transport events for one connection into session operations.
pub struct ConnectionHandler<E> {
    id: ConnectionId,
    session: Arc<DocumentSession<E>>,
    phase: ConnectionPhase,
}

impl<E: CrdtEngine + Default> ConnectionHandler<E> {
    /// Handle a new connection: resolve its session, join it and queue the
    /// initial sync on `outbound`.
    pub async fn on_connect(
        registry: &SessionRegistry<E>,
        path: &str,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let session_id = session_id_from_path(path);
        let session = registry.resolve(&session_id).await;
        let mut handler = Self {
            id: ConnectionId::new(),
            session,
            phase: ConnectionPhase::Connecting,
        };

        let synced = handler
            .session
            .subscribe(ConnectionHandle::new(handler.id, outbound))
            .await;
        handler.phase = ConnectionPhase::Joined;

        log::info!(
            "Connection {} joined session {} ({} subscribers, initial sync {})",
            handler.id,
            session_id,
            handler.session.subscriber_count().await,
            if synced { "sent" } else { "empty" }
        );
        handler
    }
}

impl<E: CrdtEngine> ConnectionHandler<E> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn session(&self) -> &Arc<DocumentSession<E>> {
        &self.session
    }

    pub async fn on_message(&self, message: Message) -> Inbound {
        if self.phase != ConnectionPhase::Joined {
            return Inbound::Ignored;
        }

        match message {
            Message::Binary(payload) => {
                let bytes = payload.len();
                match self.session.merge_delta(&payload, self.id).await {
                    Ok(outcome) => {
                        log::trace!(
                            "Merged {bytes} bytes from {} into session {}",
                            self.id,
                            self.session.id()
                        );
                        Inbound::Merged { bytes, outcome }
                    }
                    Err(e) => {
                        log::warn!(
                            "Dropping delta from {} in session {}: {e}",
                            self.id,
                            self.session.id()
                        );
                        Inbound::MergeFailed { bytes }
                    }
                }
            }
            Message::Text(_) => {
                log::warn!("Discarding non-binary frame from {}", self.id);
                Inbound::Rejected
            }
            _ => Inbound::Ignored,
        }
    }

    pub async fn on_close(&mut self) {
        if self.leave().await {
            let remaining = self.session.subscriber_count().await;
            log::info!(
                "Connection {} left session {} ({remaining} remaining)",
                self.id,
                self.session.id()
            );
            if remaining == 0 {
                log::info!("Session {} is empty; document state retained", self.session.id());
            }
        }
    }

    pub async fn on_error(&mut self, error: impl fmt::Display) {
        log::error!("Connection {} in session {} failed: {error}", self.id, self.session.id());
        self.leave().await;
    }

    /// Returns false when the connection had already left.
    async fn leave(&mut self) -> bool {
        if self.phase == ConnectionPhase::Left {
            return false;
        }
        self.phase = ConnectionPhase::Left;
        self.session.leave(self.id).await;
        true
    }
}

/// Run one WebSocket connection to completion.
///
/// Inbound frames, the outbound queue, the heartbeat and the shutdown signal
/// are multiplexed on this task.
pub async fn serve_connection<E: CrdtEngine + Default>(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry<E>>,
    config: RelayConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<ServerStats>,
) -> Result<(), RelayError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::debug!("WebSocket connection established from {addr} for path {path:?}");

    let _active = ServerStats::connection_opened(&stats);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let mut handler = ConnectionHandler::on_connect(&registry, &path, outbound_tx).await;

    // Flush the initial sync before reading anything from this connection.
    while let Ok(delta) = outbound_rx.try_recv() {
        if let Err(e) = ws_sender.send(Message::Binary(delta)).await {
            handler.on_error(e).await;
            return Ok(());
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    let result = loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {} from {addr} closed by peer", handler.id());
                        break Ok(());
                    }
                    Some(Ok(message)) => {
                        last_seen = Instant::now();
                        stats.record(handler.on_message(message).await);
                    }
                    Some(Err(e)) => break Err(e),
                }
            }

            Some(delta) = outbound_rx.recv() => {
                if let Err(e) = ws_sender.send(Message::Binary(delta)).await {
                    break Err(e);
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.idle_timeout {
                    log::info!("Connection {} from {addr} idle, closing", handler.id());
                    break Ok(());
                }
                if let Err(e) = ws_sender.send(Message::Ping(Vec::<u8>::new().into())).await {
                    break Err(e);
                }
            }

            _ = shutdown.changed() => {
                log::debug!("Closing connection {} for shutdown", handler.id());
                break Ok(());
            }
        }
    };

    match result {
        Ok(()) => {
            // Sends a Close frame, or completes the peer's close handshake.
            let _ = ws_sender.close().await;
            handler.on_close().await;
        }
        Err(e) => handler.on_error(e).await,
    }
    Ok(())
}
