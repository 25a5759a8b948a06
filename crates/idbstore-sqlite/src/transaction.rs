//! Transactions against one database
//!
//! A transaction is a thin state machine over the connection's operations.
//! Read-only transactions never touch the SQL transaction and see the writes
//! of a concurrent read-write transaction. Dropping a transaction that began
//! but did not finish rolls it back.

use idbstore_core::storage::{
    BlobWriteCompletion, CursorDirection, Durability, Transaction, TransactionMode,
};
use idbstore_core::{
    ExternalObject, IdbName, IndexMetadata, Key, KeyPath, KeyRange, RecordIdentifier, StoreError,
    StoreResult, Value,
};
use tracing::debug;

use crate::active_blob::ClientBlob;
use crate::connection::{ConnectionRef, DatabaseConnection};
use crate::cursor::SqliteCursor;
use crate::error::Result;
use crate::logging::prefix;
use crate::record_iterator::{IndexRecordIterator, ObjectStoreRecordIterator, RecordIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Active,
    /// Phase one ran, phase two has not
    Committing,
    Finished,
}

#[derive(Debug)]
pub struct SqliteTransaction {
    connection: ConnectionRef,
    mode: TransactionMode,
    durability: Durability,
    state: TransactionState,
}

impl SqliteTransaction {
    pub(crate) fn new(connection: ConnectionRef, mode: TransactionMode, durability: Durability) -> Self {
        Self {
            connection,
            mode,
            durability,
            state: TransactionState::Created,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Hand the external objects of a value to the client.
    ///
    /// Objects written earlier in this transaction come back as their source.
    /// Stored ones come back as a new client connection to their active blob.
    pub fn create_all_external_objects(
        &self,
        objects: &[ExternalObject],
    ) -> StoreResult<Vec<ClientBlob>> {
        self.ensure_active()?;
        self.run(|db| db.create_all_external_objects(objects))
    }

    fn run<R>(&self, f: impl FnOnce(&mut DatabaseConnection) -> Result<R>) -> StoreResult<R> {
        match self.connection.with(f) {
            Some(result) => Ok(result?),
            None => Err(StoreError::ConnectionClosed),
        }
    }

    fn ensure_active(&self) -> StoreResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(StoreError::TransactionInactive)
        }
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        self.ensure_active()?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(StoreError::InvalidArgument(
                "write in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_version_change(&self) -> StoreResult<()> {
        self.ensure_active()?;
        if self.mode != TransactionMode::VersionChange {
            return Err(StoreError::InvalidArgument(
                "schema change outside a version-change transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn first_record(mut iterator: Box<dyn RecordIterator>) -> StoreResult<Option<SqliteCursor>> {
        match iterator.iterate(None, None)? {
            Some(record) => Ok(Some(SqliteCursor::new(iterator, record))),
            None => Ok(None),
        }
    }
}

impl Transaction for SqliteTransaction {
    type Cursor = SqliteCursor;

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn begin(&mut self) -> StoreResult<()> {
        if self.state != TransactionState::Created {
            return Err(StoreError::InvalidArgument(
                "transaction already began".to_string(),
            ));
        }
        let (mode, durability) = (self.mode, self.durability);
        self.run(|db| db.begin_transaction(mode, durability))?;
        self.state = TransactionState::Active;
        Ok(())
    }

    fn commit_phase_one(&mut self) -> StoreResult<BlobWriteCompletion> {
        self.ensure_active()?;
        let mode = self.mode;
        let completion = self.run(|db| Ok(db.commit_phase_one(mode)))?;
        self.state = TransactionState::Committing;
        Ok(completion)
    }

    fn commit_phase_two(&mut self) -> StoreResult<()> {
        if self.state != TransactionState::Committing {
            return Err(StoreError::TransactionInactive);
        }
        let mode = self.mode;
        self.state = TransactionState::Finished;
        self.run(|db| db.commit_phase_two(mode))
    }

    fn rollback(&mut self) {
        let previous = std::mem::replace(&mut self.state, TransactionState::Finished);
        if matches!(
            previous,
            TransactionState::Active | TransactionState::Committing
        ) {
            let mode = self.mode;
            self.connection.with(|db| db.rollback_transaction(mode));
        }
    }

    fn set_database_version(&mut self, version: i64) -> StoreResult<()> {
        self.ensure_version_change()?;
        self.run(|db| db.set_database_version(version))
    }

    fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: IdbName,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> StoreResult<()> {
        self.ensure_version_change()?;
        self.run(|db| db.create_object_store(object_store_id, name, key_path, auto_increment))
    }

    fn delete_object_store(&mut self, object_store_id: i64) -> StoreResult<()> {
        self.ensure_version_change()?;
        self.run(|db| db.delete_object_store(object_store_id))
    }

    fn create_index(&mut self, object_store_id: i64, index: IndexMetadata) -> StoreResult<()> {
        self.ensure_version_change()?;
        self.run(|db| db.create_index(object_store_id, index))
    }

    fn get_key_generator_current_number(&self, object_store_id: i64) -> StoreResult<i64> {
        self.ensure_active()?;
        self.run(|db| db.get_key_generator_current_number(object_store_id))
    }

    fn maybe_update_key_generator_current_number(
        &self,
        object_store_id: i64,
        new_number: i64,
    ) -> StoreResult<()> {
        self.ensure_writable()?;
        self.run(|db| db.maybe_update_key_generator_current_number(object_store_id, new_number))
    }

    fn get_record_identifier_if_exists(
        &self,
        object_store_id: i64,
        key: &Key,
    ) -> StoreResult<Option<RecordIdentifier>> {
        self.ensure_active()?;
        self.run(|db| db.get_record_identifier_if_exists(object_store_id, key))
    }

    fn get_value(&self, object_store_id: i64, key: &Key) -> StoreResult<Option<Value>> {
        self.ensure_active()?;
        self.run(|db| db.get_value(object_store_id, key))
    }

    fn put_record(
        &self,
        object_store_id: i64,
        key: &Key,
        value: Value,
    ) -> StoreResult<RecordIdentifier> {
        self.ensure_writable()?;
        self.run(|db| db.put_record(object_store_id, key, value))
    }

    fn delete_range(&self, object_store_id: i64, range: &KeyRange) -> StoreResult<()> {
        self.ensure_writable()?;
        self.run(|db| db.delete_range(object_store_id, range))
    }

    fn get_object_store_key_count(
        &self,
        object_store_id: i64,
        range: &KeyRange,
    ) -> StoreResult<u32> {
        self.ensure_active()?;
        self.run(|db| db.get_object_store_key_count(object_store_id, range))
    }

    fn put_index_data_for_record(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
        record: &RecordIdentifier,
    ) -> StoreResult<()> {
        self.ensure_writable()?;
        self.run(|db| db.put_index_data_for_record(object_store_id, index_id, key, record))
    }

    fn get_first_primary_key_for_index_key(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
    ) -> StoreResult<Option<Key>> {
        self.ensure_active()?;
        self.run(|db| db.get_first_primary_key_for_index_key(object_store_id, index_id, key))
    }

    fn get_index_key_count(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
    ) -> StoreResult<u32> {
        self.ensure_active()?;
        self.run(|db| db.get_index_key_count(object_store_id, index_id, range))
    }

    fn open_object_store_cursor(
        &self,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> StoreResult<Option<SqliteCursor>> {
        self.ensure_active()?;
        let iterator = self.run(|db| {
            ObjectStoreRecordIterator::create(db, object_store_id, range, direction, key_only)
        })?;
        Self::first_record(Box::new(iterator))
    }

    fn open_index_cursor(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> StoreResult<Option<SqliteCursor>> {
        self.ensure_active()?;
        let iterator = self.run(|db| {
            IndexRecordIterator::create(db, object_store_id, index_id, range, direction, key_only)
        })?;
        Self::first_record(Box::new(iterator))
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Active | TransactionState::Committing
        ) {
            debug!(
                "{} {:?} transaction dropped before it finished",
                prefix::DB,
                self.mode
            );
            self.rollback();
        }
    }
}
