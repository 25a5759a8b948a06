//! Storage abstraction for IndexedDB backing stores
//!
//! This module defines the `Transaction` and `Cursor` traits that a backend
//! implements. The SQLite engine lives in the `idbstore-sqlite` crate.
//!
//! Transactions follow a two-phase commit: phase one streams any pending
//! blobs into storage, phase two makes the writes durable. `Transaction::commit`
//! runs both.

mod error;
mod traits;

pub use error::{StoreError, StoreResult};
pub use traits::{
    BlobWriteCompletion, BlobWriteResult, Cursor, CursorDirection, Durability, Transaction,
    TransactionMode,
};
