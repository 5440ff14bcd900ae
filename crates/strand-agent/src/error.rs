//! Error types for strand-agent

use thiserror::Error;

/// Result type alias using strand-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a task
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Ai(#[from] strand_ai::Error),

    /// The task was aborted; raised at the next suspension point
    #[error("Task aborted")]
    Aborted,

    /// The provider failed after the first chunk had been streamed
    #[error("Response interrupted: {0}")]
    StreamInterrupted(String),

    /// The user declined to retry a failed provider request
    #[error("API request failed: {0}")]
    ApiRequestFailed(String),

    /// Persisting or loading task state failed
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The checkpoint service failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),

    /// The user channel went away
    #[error("Channel error: {0}")]
    Channel(String),
}

impl Error {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
