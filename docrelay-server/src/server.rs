//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client B
//!            ├── /doc1 ── DocumentSession ── relay ─┤
//! Client B ──┘              (YrsEngine)          └──► Client A
//!
//! Client C ───── /doc2 ── DocumentSession ── relay ───► (other doc2 clients)
//! ```
//!
//! Each accepted TCP connection runs on its own task. Sessions are shared
//! through the [`SessionRegistry`] and outlive their connections.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::RelayConfig;
use crate::connection::{serve_connection, Inbound};
use crate::engine::{CrdtEngine, YrsEngine};
use crate::error::RelayError;
use crate::registry::SessionRegistry;

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub binary_messages: u64,
    pub inbound_bytes: u64,
    pub rejected_frames: u64,
    pub merge_failures: u64,
}

/// Lock-free server counters, updated from connection tasks.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    binary_messages: AtomicU64,
    inbound_bytes: AtomicU64,
    rejected_frames: AtomicU64,
    merge_failures: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection as active until the returned guard is dropped.
    pub fn connection_opened(stats: &Arc<Self>) -> ActiveConnection {
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            stats: Arc::clone(stats),
        }
    }

    pub fn record(&self, inbound: Inbound) {
        match inbound {
            Inbound::Merged { bytes, .. } => {
                self.binary_messages.fetch_add(1, Ordering::Relaxed);
                self.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            Inbound::MergeFailed { bytes } => {
                self.binary_messages.fetch_add(1, Ordering::Relaxed);
                self.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                self.merge_failures.fetch_add(1, Ordering::Relaxed);
            }
            Inbound::Rejected => {
                self.rejected_frames.fetch_add(1, Ordering::Relaxed);
            }
            Inbound::Ignored => {}
        }
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            binary_messages: self.binary_messages.load(Ordering::Relaxed),
            inbound_bytes: self.inbound_bytes.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
        }
    }
}

/// Guard for one active connection.
pub struct ActiveConnection {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The relay server.
pub struct RelayServer<E = YrsEngine> {
    config: RelayConfig,
    registry: Arc<SessionRegistry<E>>,
    stats: Arc<ServerStats>,
}

impl RelayServer<YrsEngine> {
    /// Create a server backed by yrs documents.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_engine(config)
    }
}

impl<E: CrdtEngine + Default> RelayServer<E> {
    /// Create a server whose sessions use engine `E`.
    pub fn with_engine(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(ServerStats::new()),
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// On shutdown the listener is dropped, every connection is told to close,
    /// and connections still open after the grace period are aborted.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), RelayError> {
        log::info!("Relay server listening on ws://{}", listener.local_addr()?);

        let (close_tx, close_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            if let Some(delay) = accept_retry_delay(&e) {
                                tokio::time::sleep(delay).await;
                            }
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let registry = Arc::clone(&self.registry);
                    let config = self.config.clone();
                    let close_rx = close_rx.clone();
                    let stats = Arc::clone(&self.stats);

                    connections.spawn(async move {
                        if let Err(e) =
                            serve_connection(stream, addr, registry, config, close_rx, stats).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }

                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        let open = connections.len();
        log::info!("Shutting down, closing {open} connections");
        let _ = close_tx.send(true);

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                self.config.shutdown_grace
            );
            connections.shutdown().await;
        }

        log::info!("Relay server stopped");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<E>> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// How long to wait before accepting again after `error`.
///
/// Errors about one failed handshake retry at once. Anything else, such as
/// running out of file descriptors, fails again immediately, so it backs off.
fn accept_retry_delay(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}
