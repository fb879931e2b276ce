//! Error types for tripsync-core

use thiserror::Error;

use crate::remote::TransportError;

/// Result type alias using tripsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tripsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Store-level failure that is not a plain SQLite error (lock poisoning, corrupt rows)
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input (e.g. a Trip without a name)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by the remote API collaborator
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error came from the persistent store.
    pub const fn is_store_error(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Sqlite(_) | Self::Io(_))
    }
}
