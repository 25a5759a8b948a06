//! Handle to one open database

use std::sync::Weak;

use idbstore_core::storage::{Durability, TransactionMode};
use idbstore_core::{DatabaseMetadata, StoreError, StoreResult};
use parking_lot::Mutex;

use crate::connection::{DatabaseConnection, RefScope};
use crate::transaction::SqliteTransaction;

/// A database opened through [`SqliteBackingStore`](crate::SqliteBackingStore).
///
/// The handle does not keep the database open. Once the database is deleted
/// and its connection destroyed, every call returns
/// [`StoreError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    connection: Weak<Mutex<DatabaseConnection>>,
}

impl SqliteDatabase {
    pub(crate) fn new(connection: Weak<Mutex<DatabaseConnection>>) -> Self {
        Self { connection }
    }

    fn with<R>(&self, f: impl FnOnce(&mut DatabaseConnection) -> R) -> StoreResult<R> {
        let connection = self.connection.upgrade().ok_or(StoreError::ConnectionClosed)?;
        let mut guard = connection.lock();
        let result = f(&mut guard);
        drop(guard);
        Ok(result)
    }

    pub fn metadata(&self) -> StoreResult<DatabaseMetadata> {
        self.with(|db| db.metadata().clone())
    }

    pub fn version(&self) -> StoreResult<i64> {
        self.with(|db| db.metadata().version)
    }

    /// No committed version yet, or deleted while blobs are still active.
    pub fn is_zygotic(&self) -> StoreResult<bool> {
        self.with(|db| db.is_zygotic())
    }

    /// Number of distinct stored blobs currently handed out to clients.
    pub fn active_blob_count(&self) -> StoreResult<usize> {
        self.with(|db| db.active_blob_count())
    }

    pub fn is_closed(&self) -> bool {
        self.connection.strong_count() == 0
    }

    /// Create a transaction. Nothing happens in SQL until it [begins](idbstore_core::storage::Transaction::begin).
    pub fn create_transaction(
        &self,
        mode: TransactionMode,
        durability: Durability,
    ) -> StoreResult<SqliteTransaction> {
        let connection = self.with(|db| db.connection_ref(RefScope::Transaction))?;
        Ok(SqliteTransaction::new(connection, mode, durability))
    }

    /// Delete this database. See [`SqliteBackingStore::delete_database`](crate::SqliteBackingStore::delete_database).
    pub fn delete_database(&self) -> StoreResult<()> {
        // A database that is already gone counts as deleted
        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };
        let mut guard = connection.lock();
        let deleted = guard.delete_idb_database();
        drop(guard);
        Ok(deleted?)
    }
}
