//! Error types for the SQLite storage engine

use idbstore_core::{DecodeError, StoreError};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SqliteError>;

/// Errors that can occur inside the SQLite engine
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Database connection or query error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored key could not be decoded
    #[error("Key decode error: {0}")]
    KeyDecode(#[from] DecodeError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller supplied a rejected id or an unknown object store
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Schema marker outside the known set
    #[error("Schema error: {0}")]
    Schema(String),

    /// Stored rows do not match what the engine writes
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The connection behind a handle is gone
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Convert SqliteError to StoreError for the storage traits
impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Database(e) => StoreError::Backend(format!("SQLite: {}", e)),
            SqliteError::KeyDecode(e) => StoreError::KeyDecode(e.to_string()),
            SqliteError::Json(e) => StoreError::Backend(format!("JSON: {}", e)),
            SqliteError::InvalidArgument(msg) => StoreError::InvalidArgument(msg),
            SqliteError::Schema(msg) => StoreError::Corruption(format!("Schema: {}", msg)),
            SqliteError::Corruption(msg) => StoreError::Corruption(msg),
            SqliteError::ConnectionClosed => StoreError::ConnectionClosed,
        }
    }
}

/// True for a UNIQUE or similar constraint failure.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
