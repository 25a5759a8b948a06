//! Storage error types

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Rejected id, unknown object store, or similar caller mistake
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage backend error (database, filesystem, etc.)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Stored data does not match what the engine wrote
    #[error("database corruption: {0}")]
    Corruption(String),

    /// Streaming pending blobs into storage failed, the transaction was rolled back
    #[error("failed to write blobs: {0}")]
    BlobWrite(String),

    /// The database connection was torn down
    #[error("connection closed")]
    ConnectionClosed,

    /// A stored key could not be decoded
    #[error("key decode error: {0}")]
    KeyDecode(String),

    /// Operation is not allowed in the current transaction state
    #[error("transaction is not active")]
    TransactionInactive,
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
