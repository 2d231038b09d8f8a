//! Fan-out of merge-produced deltas to N-1 subscribers.
//!
//! Called synchronously from [`DocumentSession::merge_delta`] while the
//! session lock is held, so a merge and its broadcast form one step.
//! Each delta is one `Bytes` buffer shared by all subscribers.
//!
//! [`DocumentSession::merge_delta`]: crate::session::DocumentSession::merge_delta

use std::collections::HashMap;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::{ConnectionHandle, ConnectionId};

/// Result of relaying one delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Subscribers the delta was pushed to
    pub delivered: usize,
    /// Subscribers skipped because their connection was not writable
    pub skipped: usize,
}

/// Snapshot of a session's relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub deltas_relayed: u64,
    pub deliveries: u64,
    pub skipped: u64,
}

/// Lock-free relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    deltas_relayed: AtomicU64,
    deliveries: AtomicU64,
    skipped: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: RelayOutcome) {
        self.deltas_relayed.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.skipped.fetch_add(outcome.skipped as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            deltas_relayed: self.deltas_relayed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Send `delta` to every subscriber except `origin`.
///
/// Closed or failing subscribers are skipped, never removed: removal belongs
/// to the connection's own close/error path.
pub fn relay(
    subscribers: &HashMap<ConnectionId, ConnectionHandle>,
    delta: Bytes,
    origin: ConnectionId,
    stats: &RelayStats,
) -> RelayOutcome {
    let mut outcome = RelayOutcome::default();

    for (id, handle) in subscribers {
        if *id == origin {
            continue;
        }
        if !handle.is_open() {
            log::warn!("Skipping subscriber {id}: connection not open");
            outcome.skipped += 1;
            continue;
        }
        match handle.push(delta.clone()) {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                log::warn!("Skipping subscriber {id}: {e}");
                outcome.skipped += 1;
            }
        }
    }

    stats.record(outcome);
    log::trace!(
        "Relayed {} bytes from {origin} to {} subscribers ({} skipped)",
        delta.len(),
        outcome.delivered,
        outcome.skipped
    );
    outcome
}
