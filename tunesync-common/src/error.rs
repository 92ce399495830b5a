//! Common error types for tunesync

use thiserror::Error;

/// Common result type for tunesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across tunesync services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (metadata columns, payload snapshots)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Durable storage upload/download failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Upstream provider API failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
