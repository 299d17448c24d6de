//! Error types for tracksync-store.

use std::path::PathBuf;

/// Result type for tracksync-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tracksync-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A timestamp could not be represented in the store.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A version number does not fit the store's signed 64-bit column, or
    /// cannot be incremented.
    #[error("Version {0} is out of range")]
    VersionOutOfRange(u64),

    /// A stored document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
