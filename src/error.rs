//! Error types for workdispatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: missing id/content, unknown item on update/remove.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A write carried a stale version token.
    #[error("concurrency conflict on key '{key}' in store '{store}'")]
    Conflict { store: String, key: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The processor was asked to stop. Never counted against the warning budget.
    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
