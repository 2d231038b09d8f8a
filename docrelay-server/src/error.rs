use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;

/// Errors surfaced by the server outside the per-connection core.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
