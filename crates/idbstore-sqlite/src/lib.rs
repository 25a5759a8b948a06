//! SQLite storage engine for IndexedDB
//!
//! Each database lives in its own SQLite connection. Records, indexes and
//! large values ("blobs") are rows of one relational schema, and cursors are
//! resumable range queries over them.
//!
//! # Features
//!
//! - Implements the `Transaction` and `Cursor` traits of `idbstore-core`
//! - Two-phase commit: pending blobs stream into storage before the SQL commit
//! - Stored blobs handed to clients stay readable after their record, or the
//!   whole database, is deleted
//! - Blob registry lookup by UUID for other subsystems
//!
//! # Example
//!
//! ```rust,no_run
//! use idbstore_core::storage::{Durability, Transaction, TransactionMode};
//! use idbstore_core::{Key, KeyPath, Value};
//! use idbstore_sqlite::SqliteBackingStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteBackingStore::in_memory();
//! let db = store.open_database("library")?;
//!
//! // Schema changes need a version-change transaction
//! let mut upgrade = db.create_transaction(TransactionMode::VersionChange, Durability::Default)?;
//! upgrade.begin()?;
//! upgrade.set_database_version(1)?;
//! upgrade.create_object_store(1, "books".into(), KeyPath::from("isbn"), false)?;
//! upgrade.commit().await?;
//!
//! let mut txn = db.create_transaction(TransactionMode::ReadWrite, Durability::Default)?;
//! txn.begin()?;
//! txn.put_record(1, &Key::from("978-0"), Value::new(b"dune".to_vec()))?;
//! txn.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod active_blob;
pub mod backing_store;
pub mod blob_pump;
pub mod blob_registry;
mod blob_writer;
pub mod config;
mod connection;
pub mod cursor;
pub mod database;
pub mod error;
pub mod logging;
mod record_iterator;
mod schema;
mod streaming_blob;
pub mod transaction;

// Re-export main types
pub use active_blob::{BlobHandle, BlobReader, ClientBlob, DataPipeGetter};
pub use backing_store::SqliteBackingStore;
pub use blob_pump::{BlobReaderClient, ReadOutcome, ReadResult};
pub use blob_registry::BlobRegistry;
pub use config::StoreConfig;
pub use cursor::SqliteCursor;
pub use database::SqliteDatabase;
pub use error::{Result, SqliteError};
pub use transaction::{SqliteTransaction, TransactionState};
