//! Error types for the session core

use dispatchsim_transport::TransportError;
use thiserror::Error;

/// Local storage failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Scenario catalog loading failures
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read scenario catalog {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Scenario catalog is empty")]
    Empty,
}

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("A message is still being delivered for session {0}")]
    TurnInFlight(String),

    #[error("Session {0} is not active")]
    NotActive(String),

    #[error("Session {0} is no longer attached")]
    Detached(String),
}

impl SessionError {
    /// Transport failures keep their status; everything else has none.
    pub fn status(&self) -> Option<u16> {
        match self {
            SessionError::Transport(e) => e.status(),
            SessionError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}
