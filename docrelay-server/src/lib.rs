//! # docrelay-server — real-time CRDT delta relay
//!
//! Clients editing a shared document connect over WebSocket at
//! `ws://host:port/<document>`. The relay merges each binary delta into the
//! document's CRDT engine and forwards what the engine emits to every other
//! client of that document. Delta bytes are never interpreted by the relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  binary frames  ┌───────────────────┐
//! │ Client (Yjs) │ ◄─────────────► │ ConnectionHandler │
//! └──────────────┘                 └─────────┬─────────┘
//!                                            │ resolve(path)
//!                                  ┌─────────▼─────────┐
//!                                  │  SessionRegistry  │
//!                                  └─────────┬─────────┘
//!                                  ┌─────────▼─────────┐
//!                                  │  DocumentSession  │
//!                                  │  engine + subs    │
//!                                  └─────────┬─────────┘
//!                                            │ merge event
//!                                  ┌─────────▼─────────┐
//!                                  │  relay (fan-out)  │
//!                                  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] — CRDT engine trait and the yrs-backed engine
//! - [`update_check`] — UTF-8 and structure check of v1 updates
//! - [`session`] — document sessions and subscriber sets
//! - [`relay`] — fan-out of merge-produced deltas, excluding the origin
//! - [`registry`] — session lookup and lazy creation
//! - [`connection`] — per-connection event handling and transport loop
//! - [`server`] — accept loop, statistics, graceful shutdown
//! - [`config`] — environment-driven configuration

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod update_check;

// Re-exports for convenience
pub use config::{ConfigError, RelayConfig};
pub use connection::{session_id_from_path, ConnectionHandler, ConnectionPhase, Inbound};
pub use engine::{CrdtEngine, EngineError, YrsEngine};
pub use error::RelayError;
pub use registry::SessionRegistry;
pub use relay::{RelayOutcome, RelayStatsSnapshot};
pub use server::{RelayServer, ServerStats, ServerStatsSnapshot};
pub use update_check::{check_update_v1, InvalidUpdate};
pub use session::{ConnectionHandle, ConnectionId, DocumentSession, SessionId, DEFAULT_SESSION};
